//! Index definitions.

use rkyv::{Archive, Deserialize, Serialize};

/// Kind of index.
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
pub enum IndexType {
    /// Primary key.
    Primary,
    /// Unique index.
    Unique,
    /// Plain (non-unique) index.
    Index,
}

/// An index over an ordered list of columns.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct IndexDefinition {
    /// Indexed columns, in order.
    pub fields: Vec<String>,
    /// Index kind.
    #[serde(rename = "type")]
    pub index_type: IndexType,
}

impl IndexDefinition {
    /// Create an index of the given kind.
    pub fn new<I, S>(index_type: IndexType, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            index_type,
        }
    }

    /// Create a primary key index.
    pub fn primary<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(IndexType::Primary, fields)
    }

    /// Create a unique index.
    pub fn unique<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(IndexType::Unique, fields)
    }

    /// Create a plain index.
    pub fn index<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(IndexType::Index, fields)
    }

    /// Whether the index enforces uniqueness. Primary keys always do.
    pub fn is_unique(&self) -> bool {
        matches!(self.index_type, IndexType::Primary | IndexType::Unique)
    }

    /// Whether this is the primary key.
    pub fn is_primary(&self) -> bool {
        self.index_type == IndexType::Primary
    }
}
