//! JSON migrator manifests.
//!
//! A manifest file holds one migrator declaration or a list of them:
//!
//! ```json
//! {
//!   "module": "Estates",
//!   "version": "1.1",
//!   "tables": [
//!     { "name": "estate_settings",
//!       "columns": [ { "name": "EstateID", "type": "integer", "auto_increment": true } ],
//!       "indices": [ { "fields": ["EstateID"], "type": "primary" } ] }
//!   ]
//! }
//! ```

use super::error::MigrationError;
use super::registry::MigratorRegistry;
use super::schema_migrator::SchemaMigrator;
use crate::connector::ColumnRenames;
use crate::schema::TableSchema;
use crate::value::Row;
use std::collections::BTreeMap;
use std::path::Path;

/// Serialized form of a [`SchemaMigrator`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigratorManifest {
    /// Module name.
    pub module: String,
    /// Version text.
    pub version: String,
    /// Declared tables.
    #[serde(default)]
    pub tables: Vec<TableSchema>,
    /// Column renames per table, old name to new name.
    #[serde(default)]
    pub column_renames: BTreeMap<String, ColumnRenames>,
    /// Table renames, old name to new name.
    #[serde(default)]
    pub table_renames: BTreeMap<String, String>,
    /// Tables to drop.
    #[serde(default)]
    pub dropped_tables: Vec<String>,
    /// Rows seeded on a fresh install, per table.
    #[serde(default)]
    pub default_rows: BTreeMap<String, Vec<Row>>,
    /// Whether the version drops or reshapes data.
    #[serde(default)]
    pub breaking_changes: bool,
    /// Whether fresh installs may start here.
    #[serde(default)]
    pub bootstrap: bool,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Many(Vec<MigratorManifest>),
    One(MigratorManifest),
}

impl MigratorManifest {
    /// Build the migrator this manifest declares.
    pub fn into_migrator(self) -> Result<SchemaMigrator, MigrationError> {
        let mut builder = SchemaMigrator::builder(self.module, self.version).tables(self.tables);
        for (table, renames) in self.column_renames {
            for (old, new) in renames {
                builder = builder.rename_column(table.clone(), old, new);
            }
        }
        for (old, new) in self.table_renames {
            builder = builder.rename_table(old, new);
        }
        for table in self.dropped_tables {
            builder = builder.drop_table(table);
        }
        for (table, rows) in self.default_rows {
            for row in rows {
                builder = builder.default_row(table.clone(), row);
            }
        }
        if self.breaking_changes {
            builder = builder.breaking();
        }
        if self.bootstrap {
            builder = builder.bootstrap();
        }
        builder.build()
    }
}

/// Parse manifest text into migrators.
pub fn parse_manifest(text: &str) -> Result<Vec<SchemaMigrator>, MigrationError> {
    let file: ManifestFile =
        serde_json::from_str(text).map_err(|e| MigrationError::Manifest(e.to_string()))?;
    let manifests = match file {
        ManifestFile::Many(list) => list,
        ManifestFile::One(one) => vec![one],
    };
    manifests
        .into_iter()
        .map(MigratorManifest::into_migrator)
        .collect()
}

/// Read a manifest file into migrators.
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Vec<SchemaMigrator>, MigrationError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| MigrationError::Manifest(format!("{}: {}", path.display(), e)))?;
    parse_manifest(&text).map_err(|e| match e {
        MigrationError::Manifest(msg) => {
            MigrationError::Manifest(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

impl MigratorRegistry {
    /// Register every migrator in a manifest file. Returns how many were added.
    pub fn register_manifest(&mut self, path: impl AsRef<Path>) -> Result<usize, MigrationError> {
        let migrators = load_manifest(path)?;
        let count = migrators.len();
        self.register_all(migrators)?;
        Ok(count)
    }
}
