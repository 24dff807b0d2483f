//! Migration-specific error types.

use crate::schema::SchemaError;
use crate::version::{Version, VersionFormatError};
use std::time::Duration;
use thiserror::Error;

/// Migration-specific errors.
///
/// Every variant raised while executing an operation names the module and
/// the version being processed.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Malformed migrator declarations, duplicate versions or an empty module.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// The persisted version does not correspond to any known migrator.
    #[error("module {module} is at version {version}, which no registered migrator provides")]
    UnknownVersion {
        /// Module name.
        module: String,
        /// Persisted version.
        version: Version,
    },

    /// Validation still failed after re-migrating and force-renaming.
    #[error("module {module} version {version}: schema validation failed: {details}")]
    ValidationFailed {
        /// Module name.
        module: String,
        /// Version that failed validation.
        version: Version,
        /// Mismatch summary.
        details: String,
    },

    /// A migrator hook failed.
    #[error("module {module} version {version}: migration failed: {reason}")]
    Execution {
        /// Module name.
        module: String,
        /// Version being applied.
        version: Version,
        /// Underlying error.
        reason: String,
    },

    /// An upgrade step failed validation and the restore point was applied.
    #[error("module {module} version {version}: validation failed after migrating, changes rolled back: {reason}")]
    RolledBack {
        /// Module name.
        module: String,
        /// Version whose validation failed.
        version: Version,
        /// Mismatch summary.
        reason: String,
    },

    /// Restoring a snapshot failed. Module data may be damaged.
    #[error("module {module} version {version}: rollback failed, data may be damaged: {reason}")]
    RollbackFailed {
        /// Module name.
        module: String,
        /// Version being applied when the rollback started.
        version: Version,
        /// Why the rollback failed.
        reason: String,
    },

    /// Another owner held the module lock for longer than the configured timeout.
    #[error("module {module}: timed out after {waited:?} waiting for migration lock (held by {holder:?})")]
    LockTimeout {
        /// Module name.
        module: String,
        /// Current lock holder, if known.
        holder: Option<String>,
        /// How long we waited.
        waited: Duration,
    },

    /// The operation was cancelled or ran past its deadline.
    #[error("module {module}: migration cancelled during {stage}")]
    Cancelled {
        /// Module name.
        module: String,
        /// Step that observed the cancellation.
        stage: String,
    },

    /// A migrator manifest could not be read or parsed.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Failure reported by a migrator hook implementation.
    #[error("{0}")]
    Hook(String),

    /// Storage error raised while processing a module version.
    #[error("module {module} version {version}: storage error: {source}")]
    ModuleStorage {
        /// Module name.
        module: String,
        /// Version being processed.
        version: Version,
        /// Connector failure.
        #[source]
        source: crate::error::Error,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),
}

impl MigrationError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        MigrationError::Configuration {
            message: message.into(),
        }
    }

    /// Attach the module and version to a bare storage error.
    pub fn at(self, module: &str, version: Version) -> Self {
        match self {
            MigrationError::Storage(source) => MigrationError::ModuleStorage {
                module: module.to_string(),
                version,
                source,
            },
            other => other,
        }
    }

    /// Whether the error leaves the module at a validated version.
    ///
    /// Only a failed rollback can leave the module somewhere else.
    pub fn is_consistent(&self) -> bool {
        !matches!(self, MigrationError::RollbackFailed { .. })
    }
}

impl From<VersionFormatError> for MigrationError {
    fn from(e: VersionFormatError) -> Self {
        MigrationError::configuration(e.to_string())
    }
}

impl From<SchemaError> for MigrationError {
    fn from(e: SchemaError) -> Self {
        MigrationError::configuration(e.to_string())
    }
}
