//! Declarative migrator built from table declarations.

use super::error::MigrationError;
use super::migrator::{ensure_tables, Migrator};
use crate::connector::{ColumnRenames, DataConnector, Filter};
use crate::schema::{is_valid_identifier, is_valid_module_name, TableSchema};
use crate::value::Row;
use crate::version::Version;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// A migrator whose behaviour is derived entirely from its declarations.
///
/// Migrating renames tables, then creates or alters every declared table
/// (carrying data across column renames), then drops retired tables.
/// Creating defaults additionally seeds default rows into empty tables.
#[derive(Debug, Clone)]
pub struct SchemaMigrator {
    name: String,
    version: Version,
    tables: Vec<TableSchema>,
    column_renames: BTreeMap<String, ColumnRenames>,
    table_renames: Vec<(String, String)>,
    dropped_tables: Vec<String>,
    default_rows: Vec<(String, Row)>,
    breaking: bool,
    bootstrap: bool,
}

impl SchemaMigrator {
    /// Start building a migrator for `name` at `version`.
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> SchemaMigratorBuilder {
        SchemaMigratorBuilder {
            name: name.into(),
            version: version.into(),
            tables: Vec::new(),
            column_renames: BTreeMap::new(),
            table_renames: Vec::new(),
            dropped_tables: Vec::new(),
            default_rows: Vec::new(),
            breaking: false,
            bootstrap: false,
        }
    }

    /// Column renames declared for `table`.
    pub fn column_renames(&self, table: &str) -> ColumnRenames {
        self.column_renames.get(table).cloned().unwrap_or_default()
    }

    /// Declared table renames, old name first.
    pub fn table_renames(&self) -> &[(String, String)] {
        &self.table_renames
    }

    /// Tables this version drops.
    pub fn dropped_tables(&self) -> &[String] {
        &self.dropped_tables
    }

    /// Rows seeded by `create_defaults`.
    pub fn default_rows(&self) -> &[(String, Row)] {
        &self.default_rows
    }

    fn seed_defaults(&self, conn: &dyn DataConnector) -> Result<(), MigrationError> {
        let mut seeded: Vec<&str> = Vec::new();
        let mut skipped: HashSet<&str> = HashSet::new();
        for (table, row) in &self.default_rows {
            if skipped.contains(table.as_str()) {
                continue;
            }
            if !seeded.contains(&table.as_str()) {
                if !conn.query(table, &Filter::all())?.is_empty() {
                    skipped.insert(table);
                    continue;
                }
                seeded.push(table);
            }
            conn.insert(table, row.clone())?;
        }
        if !seeded.is_empty() {
            debug!(module = %self.name, tables = ?seeded, "Seeded default rows");
        }
        Ok(())
    }
}

impl Migrator for SchemaMigrator {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &Version {
        &self.version
    }

    fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    fn breaking_changes(&self) -> bool {
        self.breaking
    }

    fn can_bootstrap(&self) -> bool {
        self.bootstrap
    }

    fn touched_tables(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let names = self
            .tables
            .iter()
            .map(|t| &t.name)
            .chain(self.table_renames.iter().flat_map(|(old, new)| [old, new]))
            .chain(&self.dropped_tables);
        for name in names {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        out
    }

    fn do_migrate(&self, conn: &dyn DataConnector) -> Result<(), MigrationError> {
        for (old, new) in &self.table_renames {
            if !conn.table_exists(old)? {
                continue;
            }
            if conn.table_exists(new)? {
                warn!(
                    module = %self.name,
                    from = %old,
                    to = %new,
                    "Rename target already exists, leaving both tables in place"
                );
                continue;
            }
            debug!(module = %self.name, from = %old, to = %new, "Renaming table");
            conn.rename_table(old, new)?;
        }

        ensure_tables(conn, &self.tables, |table| self.column_renames(table))?;

        for table in &self.dropped_tables {
            if conn.table_exists(table)? {
                debug!(module = %self.name, table = %table, "Dropping table");
                conn.drop_table(table)?;
            }
        }
        Ok(())
    }

    fn do_create_defaults(&self, conn: &dyn DataConnector) -> Result<(), MigrationError> {
        self.do_migrate(conn)?;
        self.seed_defaults(conn)
    }
}

/// Builder for [`SchemaMigrator`].
#[derive(Debug, Clone)]
pub struct SchemaMigratorBuilder {
    name: String,
    version: String,
    tables: Vec<TableSchema>,
    column_renames: BTreeMap<String, ColumnRenames>,
    table_renames: Vec<(String, String)>,
    dropped_tables: Vec<String>,
    default_rows: Vec<(String, Row)>,
    breaking: bool,
    bootstrap: bool,
}

impl SchemaMigratorBuilder {
    /// Declare a table.
    pub fn table(mut self, table: TableSchema) -> Self {
        self.tables.push(table);
        self
    }

    /// Declare several tables.
    pub fn tables(mut self, tables: impl IntoIterator<Item = TableSchema>) -> Self {
        self.tables.extend(tables);
        self
    }

    /// Carry data in `table` from column `old` to column `new`.
    pub fn rename_column(
        mut self,
        table: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        self.column_renames
            .entry(table.into())
            .or_default()
            .insert(old.into(), new.into());
        self
    }

    /// Rename table `old` to `new` before the declared tables are applied.
    pub fn rename_table(mut self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.table_renames.push((old.into(), new.into()));
        self
    }

    /// Drop a table no longer part of the module.
    pub fn drop_table(mut self, table: impl Into<String>) -> Self {
        self.dropped_tables.push(table.into());
        self
    }

    /// Seed a row into `table` on a fresh install.
    pub fn default_row(mut self, table: impl Into<String>, row: Row) -> Self {
        self.default_rows.push((table.into(), row));
        self
    }

    /// Mark this version as dropping or reshaping data.
    pub fn breaking(mut self) -> Self {
        self.breaking = true;
        self
    }

    /// Allow fresh installs to start from this version.
    pub fn bootstrap(mut self) -> Self {
        self.bootstrap = true;
        self
    }

    /// Validate the declarations and build the migrator.
    pub fn build(self) -> Result<SchemaMigrator, MigrationError> {
        if !is_valid_module_name(&self.name) {
            return Err(MigrationError::configuration(format!(
                "invalid module name {:?}",
                self.name
            )));
        }
        let version = Version::parse(&self.version)?;
        let context = |msg: String| {
            MigrationError::configuration(format!("{} {}: {}", self.name, version, msg))
        };

        let mut declared = HashSet::new();
        for table in &self.tables {
            table.validate().map_err(|e| context(e.to_string()))?;
            if !declared.insert(table.name.as_str()) {
                return Err(context(format!("table {} declared twice", table.name)));
            }
        }

        for (table, renames) in &self.column_renames {
            let schema = self
                .tables
                .iter()
                .find(|t| &t.name == table)
                .ok_or_else(|| context(format!("column renames for undeclared table {}", table)))?;
            for (old, new) in renames {
                if !is_valid_identifier(old) {
                    return Err(context(format!("invalid column name {:?}", old)));
                }
                if schema.column(new).is_none() {
                    return Err(context(format!(
                        "column rename target {}.{} is not declared",
                        table, new
                    )));
                }
            }
        }

        for (old, new) in &self.table_renames {
            for name in [old, new] {
                if !is_valid_identifier(name) {
                    return Err(context(format!("invalid table name {:?}", name)));
                }
            }
        }

        for table in &self.dropped_tables {
            if declared.contains(table.as_str()) {
                return Err(context(format!("table {} is both declared and dropped", table)));
            }
        }

        for (table, _) in &self.default_rows {
            if !declared.contains(table.as_str()) {
                return Err(context(format!("default rows for undeclared table {}", table)));
            }
        }

        Ok(SchemaMigrator {
            name: self.name,
            version,
            tables: self.tables,
            column_renames: self.column_renames,
            table_renames: self.table_renames,
            dropped_tables: self.dropped_tables,
            default_rows: self.default_rows,
            breaking: self.breaking,
            bootstrap: self.bootstrap,
        })
    }
}
