//! Table schema descriptors.
//!
//! A migrator declares the tables it owns as [`TableSchema`] values built
//! from [`ColumnDefinition`]s and [`IndexDefinition`]s.

mod column;
mod index;
mod table;

pub use column::{ColumnDefinition, ColumnType};
pub use index::{IndexDefinition, IndexType};
pub use table::TableSchema;

use thiserror::Error;

/// Errors raised while validating a schema declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// A table, column or module name does not follow its naming grammar.
    #[error("invalid {kind} name {name:?}")]
    InvalidIdentifier {
        /// What was being named ("table", "column", "module").
        kind: &'static str,
        /// The rejected name.
        name: String,
    },

    /// A table declares no columns.
    #[error("table {table} declares no columns")]
    NoColumns {
        /// Table name.
        table: String,
    },

    /// Two columns share a name.
    #[error("table {table} declares column {column} more than once")]
    DuplicateColumn {
        /// Table name.
        table: String,
        /// Duplicated column.
        column: String,
    },

    /// An index lists no columns.
    #[error("table {table} declares an index without columns")]
    EmptyIndex {
        /// Table name.
        table: String,
    },

    /// An index references a column the table does not declare.
    #[error("index on table {table} references unknown column {column}")]
    UnknownIndexColumn {
        /// Table name.
        table: String,
        /// Missing column.
        column: String,
    },

    /// More than one primary index.
    #[error("table {table} declares more than one primary index")]
    MultiplePrimaryKeys {
        /// Table name.
        table: String,
    },
}

/// Check a table or column name against `[A-Za-z][A-Za-z0-9_]*`.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check a module (migration) name against `[A-Z][A-Za-z0-9_]*`.
pub fn is_valid_module_name(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase()) && is_valid_identifier(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_grammar() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("User_2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2users"));
        assert!(!is_valid_identifier("_users"));
        assert!(!is_valid_identifier("user-name"));
        assert!(!is_valid_identifier("user name"));
    }

    #[test]
    fn test_module_name_grammar() {
        assert!(is_valid_module_name("Estates"));
        assert!(is_valid_module_name("Groups_V2"));
        assert!(!is_valid_module_name("estates"));
        assert!(!is_valid_module_name("Estates!"));
    }
}
