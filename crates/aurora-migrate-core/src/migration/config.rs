//! Migration manager configuration.

use super::error::MigrationError;
use crate::schema::is_valid_identifier;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default time to wait for another process's module lock.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

/// Default interval between lock attempts.
pub const DEFAULT_LOCK_POLL_MS: u64 = 100;

/// Suffix given to tables that still fail validation after a re-migrate.
pub const DEFAULT_BROKEN_SUFFIX: &str = "_broken";

/// Suffix of the snapshot tables backing a restore point.
pub const DEFAULT_RESTORE_SUFFIX: &str = "_restore";

fn default_lock_owner() -> String {
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    format!("pid-{}-{}", std::process::id(), started)
}

/// Migration manager configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Whether to validate schemas after each step, and take restore points.
    pub validate_tables: bool,
    /// How long to wait for the module lock.
    pub lock_timeout: Duration,
    /// Interval between lock attempts.
    pub lock_poll_interval: Duration,
    /// Upper bound for a whole `execute_operation` call. None means unbounded.
    pub operation_timeout: Option<Duration>,
    /// Suffix for force-renamed tables.
    pub broken_suffix: String,
    /// Suffix for restore point snapshot tables.
    pub restore_suffix: String,
    /// Identity written into the module lock.
    pub lock_owner: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            validate_tables: true,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            lock_poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_MS),
            operation_timeout: None,
            broken_suffix: DEFAULT_BROKEN_SUFFIX.to_string(),
            restore_suffix: DEFAULT_RESTORE_SUFFIX.to_string(),
            lock_owner: default_lock_owner(),
        }
    }
}

impl MigrationConfig {
    /// Enable or disable schema validation.
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate_tables = validate;
        self
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the lock poll interval.
    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// Bound the duration of an execution.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Set the lock owner identity.
    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    /// Set the suffix for force-renamed tables.
    pub fn with_broken_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.broken_suffix = suffix.into();
        self
    }

    /// Set the suffix for restore point tables.
    pub fn with_restore_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.restore_suffix = suffix.into();
        self
    }

    /// Check the table suffixes and lock owner.
    ///
    /// A suffix must be non-empty and keep a table name a valid identifier,
    /// and the two suffixes must differ.
    pub fn validate(&self) -> Result<(), MigrationError> {
        for (setting, suffix) in [
            ("broken_suffix", &self.broken_suffix),
            ("restore_suffix", &self.restore_suffix),
        ] {
            if suffix.is_empty() || !is_valid_identifier(&format!("t{}", suffix)) {
                return Err(MigrationError::configuration(format!(
                    "{} {:?} does not produce a valid table name",
                    setting, suffix
                )));
            }
        }
        if self.broken_suffix == self.restore_suffix {
            return Err(MigrationError::configuration(format!(
                "broken_suffix and restore_suffix are both {:?}",
                self.broken_suffix
            )));
        }
        if self.lock_owner.is_empty() {
            return Err(MigrationError::configuration("lock_owner is empty"));
        }
        Ok(())
    }
}
