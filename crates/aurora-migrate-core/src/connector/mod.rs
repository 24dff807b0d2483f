//! The storage contract migrations run against.
//!
//! A [`DataConnector`] provides table DDL, per-module version bookkeeping,
//! advisory module locks and basic row CRUD. [`SledConnector`] is the
//! embedded implementation.

mod store;

pub use store::SledConnector;

use crate::error::Error;
use crate::schema::{ColumnDefinition, IndexDefinition, TableSchema};
use crate::value::{Row, Value};
use crate::version::Version;
use std::collections::BTreeMap;

/// Column renames applied by [`DataConnector::update_table`], old name to new name.
pub type ColumnRenames = BTreeMap<String, String>;

/// Storage operations consumed by migrators and the migration manager.
pub trait DataConnector: Send + Sync {
    /// Check whether a table exists.
    fn table_exists(&self, name: &str) -> Result<bool, Error>;

    /// Current declaration of a table, or `None` if it does not exist.
    fn describe_table(&self, name: &str) -> Result<Option<TableSchema>, Error>;

    /// Names of all tables, sorted.
    fn list_tables(&self) -> Result<Vec<String>, Error>;

    /// Create a table. Fails if it already exists.
    fn create_table(
        &self,
        name: &str,
        columns: &[ColumnDefinition],
        indices: &[IndexDefinition],
    ) -> Result<(), Error>;

    /// Replace the declaration of an existing table, keeping its rows.
    ///
    /// Values move from old to new column names per `renames`; columns no
    /// longer declared are dropped and new columns take their default.
    fn update_table(
        &self,
        name: &str,
        columns: &[ColumnDefinition],
        indices: &[IndexDefinition],
        renames: &ColumnRenames,
    ) -> Result<(), Error>;

    /// Rename a table. Fails if `new` exists.
    fn rename_table(&self, old: &str, new: &str) -> Result<(), Error>;

    /// Drop a table and its rows.
    fn drop_table(&self, name: &str) -> Result<(), Error>;

    /// Copy a table (declaration and rows) under a new name.
    fn copy_table(&self, from: &str, to: &str) -> Result<(), Error>;

    /// Persisted version of a module, `None` if the module was never migrated.
    fn module_version(&self, module: &str) -> Result<Option<Version>, Error>;

    /// Persist a module's version.
    fn write_module_version(&self, module: &str, version: &Version) -> Result<(), Error>;

    /// Try to take the module's advisory lock for `owner`.
    ///
    /// Returns `true` only if the lock was free and now belongs to `owner`.
    /// A held lock is never granted again, not even to the same owner.
    fn try_lock_module(&self, module: &str, owner: &str) -> Result<bool, Error>;

    /// Release the lock if `owner` holds it. Returns whether it was released.
    fn unlock_module(&self, module: &str, owner: &str) -> Result<bool, Error>;

    /// Release the lock whoever holds it. Returns whether a lock was present.
    fn force_unlock_module(&self, module: &str) -> Result<bool, Error>;

    /// Current holder of the module's lock.
    fn lock_holder(&self, module: &str) -> Result<Option<String>, Error>;

    /// Rows matching `filter`, in insertion order.
    fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, Error>;

    /// Insert a row, filling defaults and auto-increment columns.
    fn insert(&self, table: &str, row: Row) -> Result<(), Error>;

    /// Set `changes` on every row matching `filter`. Returns the number of rows changed.
    fn update(&self, table: &str, filter: &Filter, changes: &Row) -> Result<usize, Error>;

    /// Delete every row matching `filter`. Returns the number of rows deleted.
    fn delete(&self, table: &str, filter: &Filter) -> Result<usize, Error>;
}

/// A conjunction of column equality conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    /// A filter matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter matching rows where `column == value`.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and_eq(column, value)
    }

    /// Add another equality condition.
    pub fn and_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    /// Columns the filter references.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().map(|(c, _)| c.as_str())
    }

    /// Check a row against every condition. Absent columns compare as NULL.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions
            .iter()
            .all(|(column, value)| row.get(column).unwrap_or(&Value::Null) == value)
    }
}
