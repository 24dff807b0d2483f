//! Core error types.

use thiserror::Error;

/// Storage and data connector errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The named table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A table with this name already exists.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// A row or filter referenced a column the table does not declare.
    #[error("unknown column {column} in table {table}")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A row violates the table declaration.
    #[error("invalid row for table {table}: {reason}")]
    InvalidRow {
        /// Table name.
        table: String,
        /// Why the row was rejected.
        reason: String,
    },

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}
