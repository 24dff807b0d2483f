//! Sled-backed data connector.

use super::{ColumnRenames, DataConnector, Filter};
use crate::error::Error;
use crate::schema::{ColumnDefinition, IndexDefinition, TableSchema};
use crate::value::{Row, Value};
use crate::version::Version;
use parking_lot::Mutex;
use sled::{Db, Tree};
use std::path::Path;
use tracing::debug;

/// Tree name for table declarations.
const TABLES_TREE: &str = "schema:tables";

/// Tree name for persisted module versions.
const MODULES_TREE: &str = "meta:modules";

/// Tree name for advisory module locks.
const LOCKS_TREE: &str = "meta:locks";

/// Prefix of the per-table row trees.
const ROWS_TREE_PREFIX: &str = "rows:";

fn rows_tree_name(table: &str) -> String {
    format!("{}{}", ROWS_TREE_PREFIX, table)
}

fn encode_row(row: &Row) -> Result<Vec<u8>, Error> {
    rkyv::to_bytes::<rkyv::rancor::Error>(row)
        .map(|v| v.to_vec())
        .map_err(|e| Error::Serialization(e.to_string()))
}

fn decode_row(bytes: &[u8]) -> Result<Row, Error> {
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<Row, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Deserialization(e.to_string()))
}

/// A [`DataConnector`] storing tables, rows and module state in sled.
///
/// Layout:
/// - `schema:tables`: table name -> rkyv [`TableSchema`]
/// - `rows:<table>`: row id (big-endian u64) -> rkyv [`Row`]
/// - `meta:modules`: module name -> version text
/// - `meta:locks`: module name -> lock owner
pub struct SledConnector {
    db: Db,
    tables: Tree,
    modules: Tree,
    locks: Tree,
    /// Serializes operations that touch more than one tree.
    write_lock: Mutex<()>,
}

impl SledConnector {
    /// Open a connector over an existing sled database.
    pub fn new(db: Db) -> Result<Self, Error> {
        let tables = db.open_tree(TABLES_TREE)?;
        let modules = db.open_tree(MODULES_TREE)?;
        let locks = db.open_tree(LOCKS_TREE)?;

        Ok(Self {
            db,
            tables,
            modules,
            locks,
            write_lock: Mutex::new(()),
        })
    }

    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(path)?;
        Self::new(db)
    }

    /// Create a connector over a temporary database removed on drop.
    pub fn temporary() -> Result<Self, Error> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::new(db)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    fn load_schema(&self, name: &str) -> Result<Option<TableSchema>, Error> {
        match self.tables.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(TableSchema::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require_schema(&self, name: &str) -> Result<TableSchema, Error> {
        self.load_schema(name)?
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    fn store_schema(&self, schema: &TableSchema) -> Result<(), Error> {
        self.tables.insert(schema.name.as_bytes(), schema.to_bytes()?)?;
        Ok(())
    }

    fn rows_tree(&self, table: &str) -> Result<Tree, Error> {
        Ok(self.db.open_tree(rows_tree_name(table))?)
    }

    fn load_rows(&self, table: &str) -> Result<Vec<(sled::IVec, Row)>, Error> {
        let tree = self.rows_tree(table)?;
        let mut rows = Vec::new();
        for entry in tree.iter() {
            let (key, bytes) = entry?;
            rows.push((key, decode_row(&bytes)?));
        }
        Ok(rows)
    }

    fn next_row_key(&self) -> Result<[u8; 8], Error> {
        Ok(self.db.generate_id()?.to_be_bytes())
    }

    fn copy_rows(&self, from: &str, to: &str) -> Result<usize, Error> {
        let source = self.rows_tree(from)?;
        let target = self.rows_tree(to)?;
        target.clear()?;
        let mut copied = 0;
        for entry in source.iter() {
            let (key, bytes) = entry?;
            target.insert(key, bytes)?;
            copied += 1;
        }
        Ok(copied)
    }

    fn remove_table(&self, name: &str) -> Result<(), Error> {
        self.tables.remove(name.as_bytes())?;
        self.db.drop_tree(rows_tree_name(name))?;
        Ok(())
    }

    fn check_columns<'a>(
        schema: &TableSchema,
        columns: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), Error> {
        for column in columns {
            if schema.column(column).is_none() {
                return Err(Error::UnknownColumn {
                    table: schema.name.clone(),
                    column: column.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_value(
        schema: &TableSchema,
        column: &ColumnDefinition,
        value: &Value,
    ) -> Result<(), Error> {
        if value.is_null() && !column.is_null && !column.auto_increment {
            return Err(Error::InvalidRow {
                table: schema.name.clone(),
                reason: format!("column {} may not be NULL", column.name),
            });
        }
        if !column.column_type.accepts(value) {
            return Err(Error::InvalidRow {
                table: schema.name.clone(),
                reason: format!(
                    "column {} of type {:?} cannot hold a {} value",
                    column.name,
                    column.column_type,
                    value.kind()
                ),
            });
        }
        Ok(())
    }

    /// Fill omitted columns and validate every value against the declaration.
    fn complete_row(
        schema: &TableSchema,
        mut row: Row,
        existing: &[(sled::IVec, Row)],
    ) -> Result<Row, Error> {
        Self::check_columns(schema, row.keys().map(String::as_str))?;

        for column in &schema.columns {
            let present = row.get(&column.name).is_some_and(|v| !v.is_null());
            if column.auto_increment && !present {
                let next = existing
                    .iter()
                    .filter_map(|(_, r)| r.get(&column.name).and_then(Value::as_i64))
                    .max()
                    .unwrap_or(0)
                    + 1;
                row.insert(column.name.clone(), Value::Int(next));
                continue;
            }
            if !row.contains_key(&column.name) {
                let value = column.implicit_value().ok_or_else(|| Error::InvalidRow {
                    table: schema.name.clone(),
                    reason: format!("missing value for column {}", column.name),
                })?;
                row.insert(column.name.clone(), value);
            }
            if let Some(value) = row.get(&column.name) {
                Self::check_value(schema, column, value)?;
            }
        }

        Ok(row)
    }

    /// Reject a row that collides with an existing row on a unique index.
    fn check_unique(
        schema: &TableSchema,
        row: &Row,
        existing: &[(sled::IVec, Row)],
    ) -> Result<(), Error> {
        for index in schema.indices.iter().filter(|i| i.is_unique()) {
            let key: Vec<&Value> = index
                .fields
                .iter()
                .map(|f| row.get(f).unwrap_or(&Value::Null))
                .collect();
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            let clash = existing.iter().any(|(_, other)| {
                index
                    .fields
                    .iter()
                    .zip(&key)
                    .all(|(f, v)| other.get(f) == Some(*v))
            });
            if clash {
                return Err(Error::InvalidRow {
                    table: schema.name.clone(),
                    reason: format!("duplicate value for unique index ({})", index.fields.join(", ")),
                });
            }
        }
        Ok(())
    }
}

impl DataConnector for SledConnector {
    fn table_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.tables.contains_key(name.as_bytes())?)
    }

    fn describe_table(&self, name: &str) -> Result<Option<TableSchema>, Error> {
        self.load_schema(name)
    }

    fn list_tables(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        for key in self.tables.iter().keys() {
            let key = key?;
            let name = std::str::from_utf8(&key)
                .map_err(|e| Error::InvalidData(format!("table name is not UTF-8: {}", e)))?;
            names.push(name.to_string());
        }
        names.sort();
        Ok(names)
    }

    fn create_table(
        &self,
        name: &str,
        columns: &[ColumnDefinition],
        indices: &[IndexDefinition],
    ) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        if self.table_exists(name)? {
            return Err(Error::TableExists(name.to_string()));
        }

        let schema = TableSchema::from_parts(name, columns, indices);
        schema
            .validate()
            .map_err(|e| Error::InvalidData(e.to_string()))?;

        self.rows_tree(name)?.clear()?;
        self.store_schema(&schema)?;
        debug!(table = name, columns = columns.len(), "Created table");
        Ok(())
    }

    fn update_table(
        &self,
        name: &str,
        columns: &[ColumnDefinition],
        indices: &[IndexDefinition],
        renames: &ColumnRenames,
    ) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.require_schema(name)?;

        let schema = TableSchema::from_parts(name, columns, indices);
        schema
            .validate()
            .map_err(|e| Error::InvalidData(e.to_string()))?;

        // Rows are rebuilt in full before any is written back.
        let mut rebuilt = Vec::new();
        for (position, (key, old_row)) in self.load_rows(name)?.into_iter().enumerate() {
            let mut new_row = Row::new();
            for column in &schema.columns {
                let source = renames
                    .iter()
                    .find(|(_, new)| *new == &column.name)
                    .map(|(old, _)| old.as_str())
                    .unwrap_or(column.name.as_str());
                let value = match old_row.get(source) {
                    Some(v) => v.clone(),
                    None if column.auto_increment => Value::Int(position as i64 + 1),
                    None => column.implicit_value().ok_or_else(|| Error::InvalidRow {
                        table: name.to_string(),
                        reason: format!(
                            "new column {} is NOT NULL without a default and the table has rows",
                            column.name
                        ),
                    })?,
                };
                new_row.insert(column.name.clone(), value);
            }
            rebuilt.push((key, new_row));
        }

        let tree = self.rows_tree(name)?;
        let rewritten = rebuilt.len();
        for (key, row) in rebuilt {
            tree.insert(key, encode_row(&row)?)?;
        }

        self.store_schema(&schema)?;
        debug!(table = name, rows = rewritten, renames = renames.len(), "Updated table");
        Ok(())
    }

    fn rename_table(&self, old: &str, new: &str) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        let schema = self.require_schema(old)?;
        if self.table_exists(new)? {
            return Err(Error::TableExists(new.to_string()));
        }

        let rows = self.copy_rows(old, new)?;
        self.store_schema(&schema.renamed(new))?;
        self.remove_table(old)?;
        debug!(from = old, to = new, rows, "Renamed table");
        Ok(())
    }

    fn drop_table(&self, name: &str) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        self.require_schema(name)?;
        self.remove_table(name)?;
        debug!(table = name, "Dropped table");
        Ok(())
    }

    fn copy_table(&self, from: &str, to: &str) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        let schema = self.require_schema(from)?;
        if self.table_exists(to)? {
            return Err(Error::TableExists(to.to_string()));
        }

        let rows = self.copy_rows(from, to)?;
        self.store_schema(&schema.renamed(to))?;
        debug!(from, to, rows, "Copied table");
        Ok(())
    }

    fn module_version(&self, module: &str) -> Result<Option<Version>, Error> {
        match self.modules.get(module.as_bytes())? {
            Some(bytes) => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|e| Error::InvalidData(format!("module version is not UTF-8: {}", e)))?;
                let version = Version::parse(text).map_err(|e| Error::InvalidData(e.to_string()))?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    fn write_module_version(&self, module: &str, version: &Version) -> Result<(), Error> {
        self.modules
            .insert(module.as_bytes(), version.to_string().as_bytes())?;
        debug!(module, %version, "Wrote module version");
        Ok(())
    }

    fn try_lock_module(&self, module: &str, owner: &str) -> Result<bool, Error> {
        match self
            .locks
            .compare_and_swap(module.as_bytes(), None::<&[u8]>, Some(owner.as_bytes()))?
        {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    fn unlock_module(&self, module: &str, owner: &str) -> Result<bool, Error> {
        let swapped = self
            .locks
            .compare_and_swap(module.as_bytes(), Some(owner.as_bytes()), None::<&[u8]>)?;
        Ok(swapped.is_ok())
    }

    fn force_unlock_module(&self, module: &str) -> Result<bool, Error> {
        Ok(self.locks.remove(module.as_bytes())?.is_some())
    }

    fn lock_holder(&self, module: &str) -> Result<Option<String>, Error> {
        Ok(self
            .locks
            .get(module.as_bytes())?
            .map(|owner| String::from_utf8_lossy(&owner).into_owned()))
    }

    fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, Error> {
        let schema = self.require_schema(table)?;
        Self::check_columns(&schema, filter.columns())?;

        Ok(self
            .load_rows(table)?
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| filter.matches(row))
            .collect())
    }

    fn insert(&self, table: &str, row: Row) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        let schema = self.require_schema(table)?;
        let existing = self.load_rows(table)?;

        let row = Self::complete_row(&schema, row, &existing)?;
        Self::check_unique(&schema, &row, &existing)?;

        let key = self.next_row_key()?;
        self.rows_tree(table)?.insert(key, encode_row(&row)?)?;
        Ok(())
    }

    fn update(&self, table: &str, filter: &Filter, changes: &Row) -> Result<usize, Error> {
        let _guard = self.write_lock.lock();
        let schema = self.require_schema(table)?;
        Self::check_columns(&schema, filter.columns())?;
        Self::check_columns(&schema, changes.keys().map(String::as_str))?;
        for (name, value) in changes {
            if let Some(column) = schema.column(name) {
                Self::check_value(&schema, column, value)?;
            }
        }

        let mut rows = self.load_rows(table)?;
        let mut changed = Vec::new();
        for (index, (_, row)) in rows.iter_mut().enumerate() {
            if !filter.matches(row) {
                continue;
            }
            for (name, value) in changes {
                row.insert(name.clone(), value.clone());
            }
            changed.push(index);
        }

        for &index in &changed {
            let others: Vec<(sled::IVec, Row)> = rows
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .map(|(_, entry)| entry.clone())
                .collect();
            Self::check_unique(&schema, &rows[index].1, &others)?;
        }

        let tree = self.rows_tree(table)?;
        for &index in &changed {
            let (key, row) = &rows[index];
            tree.insert(key, encode_row(row)?)?;
        }
        Ok(changed.len())
    }

    fn delete(&self, table: &str, filter: &Filter) -> Result<usize, Error> {
        let _guard = self.write_lock.lock();
        let schema = self.require_schema(table)?;
        Self::check_columns(&schema, filter.columns())?;

        let tree = self.rows_tree(table)?;
        let mut deleted = 0;
        for (key, row) in self.load_rows(table)? {
            if filter.matches(&row) {
                tree.remove(key)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
