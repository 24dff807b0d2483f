//! Column definitions.

use crate::value::Value;
use rkyv::{Archive, Deserialize, Serialize};

/// Column data types understood by the data connector.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Binary large object.
    Blob,
    /// Long binary large object.
    LongBlob,
    /// Fixed-width text.
    Char,
    /// Calendar date.
    Date,
    /// Date and time.
    DateTime,
    /// Double precision float.
    Double,
    /// Integer.
    Integer,
    /// Variable-width text.
    String,
    /// Text.
    Text,
    /// Medium text.
    MediumText,
    /// Long text.
    LongText,
    /// Small integer.
    TinyInt,
    /// Single precision float.
    Float,
    /// Boolean.
    Boolean,
    /// UUID stored as text.
    Uuid,
}

impl ColumnType {
    /// Check if this type holds integers.
    pub fn is_integer(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::TinyInt)
    }

    /// Check if this type holds binary data.
    pub fn is_binary(&self) -> bool {
        matches!(self, ColumnType::Blob | ColumnType::LongBlob)
    }

    /// Check whether a (non-null) value can be stored in a column of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Boolean, Value::Int(i)) => *i == 0 || *i == 1,
            (t, Value::Int(_)) if t.is_integer() => true,
            (t, Value::Bool(_)) if t.is_integer() => true,
            (ColumnType::Double | ColumnType::Float, Value::Int(_) | Value::Float(_)) => true,
            (t, Value::Bytes(_)) if t.is_binary() => true,
            (
                ColumnType::Char
                | ColumnType::Date
                | ColumnType::DateTime
                | ColumnType::String
                | ColumnType::Text
                | ColumnType::MediumText
                | ColumnType::LongText
                | ColumnType::Uuid,
                Value::Text(_),
            ) => true,
            _ => false,
        }
    }

    /// Convert a textual default into a value of this type.
    pub fn parse_default(&self, raw: &str) -> Option<Value> {
        match self {
            ColumnType::Integer | ColumnType::TinyInt => raw.trim().parse().ok().map(Value::Int),
            ColumnType::Double | ColumnType::Float => raw.trim().parse().ok().map(Value::Float),
            ColumnType::Boolean => match raw.trim() {
                "1" | "true" | "TRUE" => Some(Value::Bool(true)),
                "0" | "false" | "FALSE" => Some(Value::Bool(false)),
                _ => None,
            },
            ColumnType::Blob | ColumnType::LongBlob => Some(Value::Bytes(raw.as_bytes().to_vec())),
            _ => Some(Value::Text(raw.to_string())),
        }
    }
}

/// A column within a table declaration.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ColumnDefinition {
    /// Column name.
    pub name: String,
    /// Column data type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Declared size (character width, display width).
    #[serde(default)]
    pub size: Option<u32>,
    /// Whether NULL is allowed.
    #[serde(default)]
    pub is_null: bool,
    /// Whether a numeric column is unsigned.
    #[serde(default)]
    pub unsigned: bool,
    /// Whether the column is filled from a per-table counter.
    #[serde(default)]
    pub auto_increment: bool,
    /// Default value in textual form.
    #[serde(default)]
    pub default_value: Option<String>,
}

impl ColumnDefinition {
    /// Create a new non-null column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            size: None,
            is_null: false,
            unsigned: false,
            auto_increment: false,
            default_value: None,
        }
    }

    /// Create a nullable column.
    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            is_null: true,
            ..Self::new(name, column_type)
        }
    }

    /// Set the declared size.
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the default value.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default_value = Some(default.into());
        self
    }

    /// Mark as unsigned.
    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    /// Mark as auto-increment.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Value a new row gets when the column is omitted.
    ///
    /// Returns `None` when the column has no default and may not be NULL.
    pub fn implicit_value(&self) -> Option<Value> {
        match &self.default_value {
            Some(raw) => self.column_type.parse_default(raw),
            None if self.is_null => Some(Value::Null),
            None => None,
        }
    }
}
