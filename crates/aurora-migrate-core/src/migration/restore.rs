//! Restore points: table snapshots taken before an upgrade walk.

use crate::connector::DataConnector;
use crate::error::Error;
use crate::version::Version;
use tracing::{debug, warn};

/// State of one table when the restore point was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Snapshot {
    /// The table existed and was copied to `backup`.
    Copied { table: String, backup: String },
    /// The table did not exist.
    Absent { table: String },
}

impl Snapshot {
    fn table(&self) -> &str {
        match self {
            Snapshot::Copied { table, .. } | Snapshot::Absent { table } => table,
        }
    }
}

/// Pre-image of a module's tables and version.
///
/// A restore point must end in [`RestorePoint::restore`] or
/// [`RestorePoint::clear`]. Dropping it otherwise leaves the snapshot tables
/// in storage and logs a warning naming them.
#[derive(Debug)]
pub struct RestorePoint {
    module: String,
    version: Option<Version>,
    suffix: String,
    snapshots: Vec<Snapshot>,
    settled: bool,
}

impl RestorePoint {
    /// Snapshot `tables` and the persisted version of `module`.
    pub fn capture<I, S>(
        conn: &dyn DataConnector,
        module: &str,
        tables: I,
        suffix: &str,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if suffix.is_empty() {
            return Err(Error::InvalidData(format!(
                "restore point for {} needs a non-empty table suffix",
                module
            )));
        }
        let mut point = Self {
            module: module.to_string(),
            version: conn.module_version(module)?,
            suffix: suffix.to_string(),
            snapshots: Vec::new(),
            settled: false,
        };
        point.cover(conn, tables)?;
        Ok(point)
    }

    /// Add tables not yet covered. Tables that do not exist are recorded so
    /// a restore drops them.
    pub fn cover<I, S>(&mut self, conn: &dyn DataConnector, tables: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for table in tables {
            let table = table.as_ref();
            if self.covers(table) {
                continue;
            }
            if conn.table_exists(table)? {
                let backup = format!("{}{}", table, self.suffix);
                if conn.table_exists(&backup)? {
                    conn.drop_table(&backup)?;
                }
                conn.copy_table(table, &backup)?;
                debug!(module = %self.module, table, backup = %backup, "Snapshotted table");
                self.snapshots.push(Snapshot::Copied {
                    table: table.to_string(),
                    backup,
                });
            } else {
                self.snapshots.push(Snapshot::Absent {
                    table: table.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether `table` is part of this restore point.
    pub fn covers(&self, table: &str) -> bool {
        self.snapshots.iter().any(|s| s.table() == table)
    }

    /// Module the restore point belongs to.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Module version at capture time.
    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Names of the snapshot tables held in storage.
    pub fn backups(&self) -> impl Iterator<Item = &str> {
        self.snapshots.iter().filter_map(|s| match s {
            Snapshot::Copied { backup, .. } => Some(backup.as_str()),
            Snapshot::Absent { .. } => None,
        })
    }

    /// Put every table and the module version back as captured.
    pub fn restore(mut self, conn: &dyn DataConnector) -> Result<(), Error> {
        for snapshot in &self.snapshots {
            match snapshot {
                Snapshot::Copied { table, backup } => {
                    if conn.table_exists(table)? {
                        conn.drop_table(table)?;
                    }
                    conn.rename_table(backup, table)?;
                }
                Snapshot::Absent { table } => {
                    if conn.table_exists(table)? {
                        conn.drop_table(table)?;
                    }
                }
            }
            debug!(module = %self.module, table = snapshot.table(), "Restored table");
        }
        // An unversioned module has nothing to rewrite.
        if let Some(version) = &self.version {
            conn.write_module_version(&self.module, version)?;
        }
        self.settled = true;
        Ok(())
    }

    /// Drop the snapshot tables.
    pub fn clear(mut self, conn: &dyn DataConnector) -> Result<(), Error> {
        for snapshot in &self.snapshots {
            if let Snapshot::Copied { backup, .. } = snapshot {
                if conn.table_exists(backup)? {
                    conn.drop_table(backup)?;
                }
            }
        }
        self.settled = true;
        Ok(())
    }
}

impl Drop for RestorePoint {
    fn drop(&mut self) {
        if !self.settled {
            let backups: Vec<&str> = self.backups().collect();
            if !backups.is_empty() {
                warn!(
                    module = %self.module,
                    backups = ?backups,
                    "Restore point abandoned, snapshot tables left in storage"
                );
            }
        }
    }
}
