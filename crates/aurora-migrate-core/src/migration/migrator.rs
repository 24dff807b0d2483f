//! The migrator contract: one implementation per schema version of a module.

use super::error::MigrationError;
use super::restore::RestorePoint;
use crate::connector::{ColumnRenames, DataConnector};
use crate::schema::TableSchema;
use crate::version::Version;
use std::fmt;
use tracing::debug;

/// How one declared table differs from the stored one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMismatch {
    /// Declared table name.
    pub table: String,
    /// Whether the table is missing altogether.
    pub missing: bool,
    /// Column and index differences.
    pub problems: Vec<String>,
}

impl fmt::Display for TableMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.missing {
            write!(f, "table {} does not exist", self.table)
        } else {
            write!(f, "table {}: {}", self.table, self.problems.join(", "))
        }
    }
}

/// Outcome of validating a migrator against storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaReport {
    /// Version persisted for the module.
    pub persisted_version: Option<Version>,
    /// Version the migrator declares.
    pub expected_version: Version,
    /// Tables that do not match their declaration.
    pub mismatches: Vec<TableMismatch>,
}

impl SchemaReport {
    /// Whether the version matches and every table matches its declaration.
    pub fn is_valid(&self) -> bool {
        self.version_matches() && self.mismatches.is_empty()
    }

    /// Whether the persisted version is the expected one.
    pub fn version_matches(&self) -> bool {
        self.persisted_version.as_ref() == Some(&self.expected_version)
    }

    /// Mismatched tables that exist in storage.
    pub fn existing_mismatched_tables(&self) -> impl Iterator<Item = &str> {
        self.mismatches
            .iter()
            .filter(|m| !m.missing)
            .map(|m| m.table.as_str())
    }

    /// One-line description of every problem.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.version_matches() {
            match &self.persisted_version {
                Some(v) => parts.push(format!(
                    "persisted version {} is not {}",
                    v, self.expected_version
                )),
                None => parts.push(format!(
                    "no persisted version, expected {}",
                    self.expected_version
                )),
            }
        }
        parts.extend(self.mismatches.iter().map(|m| m.to_string()));
        if parts.is_empty() {
            "valid".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Compare each declared table with what storage holds.
pub fn check_tables(
    conn: &dyn DataConnector,
    tables: &[TableSchema],
) -> Result<Vec<TableMismatch>, MigrationError> {
    let mut mismatches = Vec::new();
    for declared in tables {
        match conn.describe_table(&declared.name)? {
            None => mismatches.push(TableMismatch {
                table: declared.name.clone(),
                missing: true,
                problems: Vec::new(),
            }),
            Some(actual) => {
                let problems = declared.differences(&actual);
                if !problems.is_empty() {
                    mismatches.push(TableMismatch {
                        table: declared.name.clone(),
                        missing: false,
                        problems,
                    });
                }
            }
        }
    }
    Ok(mismatches)
}

/// Create missing tables and bring differing ones to their declaration.
pub fn ensure_tables<F>(
    conn: &dyn DataConnector,
    tables: &[TableSchema],
    renames_for: F,
) -> Result<(), MigrationError>
where
    F: Fn(&str) -> ColumnRenames,
{
    for declared in tables {
        match conn.describe_table(&declared.name)? {
            None => {
                debug!(table = %declared.name, "Creating table");
                conn.create_table(&declared.name, &declared.columns, &declared.indices)?;
            }
            Some(actual) if !declared.differences(&actual).is_empty() => {
                debug!(table = %declared.name, "Updating table");
                conn.update_table(
                    &declared.name,
                    &declared.columns,
                    &declared.indices,
                    &renames_for(&declared.name),
                )?;
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// One schema version of a module.
///
/// Implementors supply identity and may override the `do_*` hooks; the
/// provided `validate`, `migrate`, `create_defaults` and
/// `prepare_restore_point` wrap those hooks with version bookkeeping and are
/// not meant to be overridden.
pub trait Migrator: Send + Sync {
    /// Module name.
    fn name(&self) -> &str;

    /// Schema version this migrator produces.
    fn version(&self) -> &Version;

    /// Tables this version declares.
    fn tables(&self) -> &[TableSchema];

    /// Whether this version drops or reshapes data.
    fn breaking_changes(&self) -> bool {
        false
    }

    /// Whether a fresh install may start from this version.
    fn can_bootstrap(&self) -> bool {
        false
    }

    /// Every table this migrator may create, alter, rename or drop.
    fn touched_tables(&self) -> Vec<String> {
        self.tables().iter().map(|t| t.name.clone()).collect()
    }

    /// Compare storage with the declared tables. Must not mutate anything.
    fn do_validate(&self, conn: &dyn DataConnector) -> Result<Vec<TableMismatch>, MigrationError> {
        check_tables(conn, self.tables())
    }

    /// Bring storage to this version's schema.
    fn do_migrate(&self, conn: &dyn DataConnector) -> Result<(), MigrationError> {
        ensure_tables(conn, self.tables(), |_| ColumnRenames::new())
    }

    /// Create this version's schema from scratch, with default data.
    fn do_create_defaults(&self, conn: &dyn DataConnector) -> Result<(), MigrationError> {
        self.do_migrate(conn)
    }

    /// Runs after this version was applied and validated.
    fn finished_migration(&self, _conn: &dyn DataConnector) -> Result<(), MigrationError> {
        Ok(())
    }

    /// Full validation report: persisted version and table shapes.
    fn inspect(&self, conn: &dyn DataConnector) -> Result<SchemaReport, MigrationError> {
        let persisted_version = conn.module_version(self.name())?;
        let mismatches = self.do_validate(conn)?;
        Ok(SchemaReport {
            persisted_version,
            expected_version: *self.version(),
            mismatches,
        })
    }

    /// Whether storage is exactly at this version.
    fn validate(&self, conn: &dyn DataConnector) -> Result<bool, MigrationError> {
        Ok(self.inspect(conn)?.is_valid())
    }

    /// Apply this version and record it as the module version.
    fn migrate(&self, conn: &dyn DataConnector) -> Result<(), MigrationError> {
        self.do_migrate(conn)?;
        conn.write_module_version(self.name(), self.version())?;
        Ok(())
    }

    /// Install this version fresh and record it as the module version.
    fn create_defaults(&self, conn: &dyn DataConnector) -> Result<(), MigrationError> {
        self.do_create_defaults(conn)?;
        conn.write_module_version(self.name(), self.version())?;
        Ok(())
    }

    /// Snapshot every table this migrator touches.
    fn prepare_restore_point(
        &self,
        conn: &dyn DataConnector,
        suffix: &str,
    ) -> Result<RestorePoint, MigrationError> {
        Ok(RestorePoint::capture(
            conn,
            self.name(),
            self.touched_tables(),
            suffix,
        )?)
    }
}

impl fmt::Debug for dyn Migrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrator")
            .field("name", &self.name())
            .field("version", &self.version().to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SledConnector;
    use crate::schema::{ColumnDefinition, ColumnType, IndexDefinition};

    struct Plain {
        version: Version,
        tables: Vec<TableSchema>,
    }

    impl Migrator for Plain {
        fn name(&self) -> &str {
            "Inventory"
        }
        fn version(&self) -> &Version {
            &self.version
        }
        fn tables(&self) -> &[TableSchema] {
            &self.tables
        }
    }

    fn inventory(extra_column: bool) -> Plain {
        let mut items = TableSchema::new("inventoryitems")
            .with_column(ColumnDefinition::new("inventoryID", ColumnType::Uuid).with_size(36))
            .with_column(ColumnDefinition::new("assetID", ColumnType::Uuid).with_size(36))
            .with_index(IndexDefinition::primary(["inventoryID"]));
        if extra_column {
            items = items.with_column(ColumnDefinition::nullable("flags", ColumnType::Integer));
        }
        Plain {
            version: Version::parse(if extra_column { "1.1" } else { "1.0" }).unwrap(),
            tables: vec![items],
        }
    }

    #[test]
    fn test_validate_requires_version_and_tables() {
        let conn = SledConnector::temporary().unwrap();
        let m = inventory(false);

        let report = m.inspect(&conn).unwrap();
        assert!(!report.is_valid());
        assert!(!report.version_matches());
        assert!(report.mismatches[0].missing);

        m.do_migrate(&conn).unwrap();
        // Tables match but no version was written.
        assert!(!m.validate(&conn).unwrap());

        m.migrate(&conn).unwrap();
        assert!(m.validate(&conn).unwrap());
        assert_eq!(conn.module_version("Inventory").unwrap(), Some(m.version));
    }

    #[test]
    fn test_migrate_is_idempotent_and_alters() {
        let conn = SledConnector::temporary().unwrap();
        inventory(false).migrate(&conn).unwrap();
        inventory(false).migrate(&conn).unwrap();

        let next = inventory(true);
        let report = next.inspect(&conn).unwrap();
        assert_eq!(report.existing_mismatched_tables().collect::<Vec<_>>(), vec!["inventoryitems"]);

        next.migrate(&conn).unwrap();
        assert!(next.validate(&conn).unwrap());
        assert!(!inventory(false).validate(&conn).unwrap());
    }

    #[test]
    fn test_summary() {
        let report = SchemaReport {
            persisted_version: None,
            expected_version: Version::parse("1.0").unwrap(),
            mismatches: vec![TableMismatch {
                table: "assets".into(),
                missing: false,
                problems: vec!["missing column data".into()],
            }],
        };
        assert_eq!(
            report.summary(),
            "no persisted version, expected 1.0; table assets: missing column data"
        );
    }
}
