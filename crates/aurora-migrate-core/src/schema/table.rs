//! Table schema - the declaration of one table.

use super::{is_valid_identifier, ColumnDefinition, IndexDefinition, SchemaError};
use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashSet;

/// Columns and indices of one table.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns, in declaration order.
    pub columns: Vec<ColumnDefinition>,
    /// Indices.
    #[serde(default)]
    pub indices: Vec<IndexDefinition>,
}

impl TableSchema {
    /// Create an empty table declaration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indices: Vec::new(),
        }
    }

    /// Create a declaration from its parts.
    pub fn from_parts(
        name: impl Into<String>,
        columns: &[ColumnDefinition],
        indices: &[IndexDefinition],
    ) -> Self {
        Self {
            name: name.into(),
            columns: columns.to_vec(),
            indices: indices.to_vec(),
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indices.push(index);
        self
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The primary index, if declared.
    pub fn primary_index(&self) -> Option<&IndexDefinition> {
        self.indices.iter().find(|i| i.is_primary())
    }

    /// A copy of this declaration under another table name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Check names, column uniqueness and index references.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if !is_valid_identifier(&self.name) {
            return Err(SchemaError::InvalidIdentifier {
                kind: "table",
                name: self.name.clone(),
            });
        }
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns {
                table: self.name.clone(),
            });
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !is_valid_identifier(&column.name) {
                return Err(SchemaError::InvalidIdentifier {
                    kind: "column",
                    name: column.name.clone(),
                });
            }
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(SchemaError::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.name.clone(),
                });
            }
        }

        let mut primaries = 0;
        for index in &self.indices {
            if index.fields.is_empty() {
                return Err(SchemaError::EmptyIndex {
                    table: self.name.clone(),
                });
            }
            if let Some(missing) = index.fields.iter().find(|f| self.column(f).is_none()) {
                return Err(SchemaError::UnknownIndexColumn {
                    table: self.name.clone(),
                    column: missing.clone(),
                });
            }
            if index.is_primary() {
                primaries += 1;
            }
        }
        if primaries > 1 {
            return Err(SchemaError::MultiplePrimaryKeys {
                table: self.name.clone(),
            });
        }

        Ok(())
    }

    /// Describe how `actual` differs from this declaration.
    ///
    /// Columns are matched by name regardless of position; indices are
    /// compared as a set. An empty result means the table matches.
    pub fn differences(&self, actual: &TableSchema) -> Vec<String> {
        let mut out = Vec::new();

        for expected in &self.columns {
            match actual.column(&expected.name) {
                None => out.push(format!("missing column {}", expected.name)),
                Some(found) if found != expected => {
                    out.push(format!("column {} differs from declaration", expected.name))
                }
                Some(_) => {}
            }
        }
        for found in &actual.columns {
            if self.column(&found.name).is_none() {
                out.push(format!("undeclared column {}", found.name));
            }
        }

        for expected in &self.indices {
            if !actual.indices.contains(expected) {
                out.push(format!(
                    "missing {:?} index on ({})",
                    expected.index_type,
                    expected.fields.join(", ")
                ));
            }
        }
        for found in &actual.indices {
            if !self.indices.contains(found) {
                out.push(format!(
                    "undeclared {:?} index on ({})",
                    found.index_type,
                    found.fields.join(", ")
                ));
            }
        }

        out
    }

    /// Serialize the declaration to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a declaration from bytes.
    ///
    /// The input is copied into an aligned buffer first, since sled values
    /// carry no alignment guarantee.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}
