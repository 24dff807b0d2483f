//! Advisory per-module migration lock.

use super::cancel::CancelToken;
use super::error::MigrationError;
use crate::connector::DataConnector;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Holds a module's migration lock until dropped.
pub struct ModuleLock<'a> {
    conn: &'a dyn DataConnector,
    module: String,
    owner: String,
}

impl<'a> ModuleLock<'a> {
    /// Poll for the lock every `poll` until `timeout` elapses.
    pub fn acquire(
        conn: &'a dyn DataConnector,
        module: &str,
        owner: &str,
        timeout: Duration,
        poll: Duration,
        cancel: &CancelToken,
    ) -> Result<Self, MigrationError> {
        let started = Instant::now();
        loop {
            if conn.try_lock_module(module, owner)? {
                debug!(module, owner, "Acquired migration lock");
                return Ok(Self {
                    conn,
                    module: module.to_string(),
                    owner: owner.to_string(),
                });
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(MigrationError::LockTimeout {
                    module: module.to_string(),
                    holder: conn.lock_holder(module)?,
                    waited,
                });
            }
            cancel.check(module, "waiting for migration lock")?;
            std::thread::sleep(poll.min(timeout - waited));
        }
    }

    /// Locked module.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Lock owner identity.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for ModuleLock<'_> {
    fn drop(&mut self) {
        match self.conn.unlock_module(&self.module, &self.owner) {
            Ok(true) => debug!(module = %self.module, "Released migration lock"),
            Ok(false) => warn!(
                module = %self.module,
                owner = %self.owner,
                "Migration lock was no longer held at release"
            ),
            Err(e) => warn!(module = %self.module, error = %e, "Failed to release migration lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SledConnector;

    #[test]
    fn test_guard_releases_on_drop() {
        let conn = SledConnector::temporary().unwrap();
        let cancel = CancelToken::new();
        {
            let lock = ModuleLock::acquire(
                &conn,
                "Assets",
                "a",
                Duration::from_millis(10),
                Duration::from_millis(1),
                &cancel,
            )
            .unwrap();
            assert_eq!(lock.owner(), "a");
            assert_eq!(conn.lock_holder("Assets").unwrap().as_deref(), Some("a"));
        }
        assert_eq!(conn.lock_holder("Assets").unwrap(), None);
    }

    #[test]
    fn test_times_out_on_foreign_lock() {
        let conn = SledConnector::temporary().unwrap();
        assert!(conn.try_lock_module("Assets", "other").unwrap());

        let err = ModuleLock::acquire(
            &conn,
            "Assets",
            "me",
            Duration::from_millis(20),
            Duration::from_millis(5),
            &CancelToken::new(),
        )
        .err()
        .unwrap();
        match err {
            MigrationError::LockTimeout { holder, waited, .. } => {
                assert_eq!(holder.as_deref(), Some("other"));
                assert!(waited >= Duration::from_millis(20));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The foreign lock is untouched.
        assert_eq!(conn.lock_holder("Assets").unwrap().as_deref(), Some("other"));
    }

    #[test]
    fn test_same_owner_cannot_lock_twice() {
        let conn = SledConnector::temporary().unwrap();
        let cancel = CancelToken::new();
        let first = ModuleLock::acquire(
            &conn,
            "Assets",
            "region-server",
            Duration::from_millis(10),
            Duration::from_millis(1),
            &cancel,
        )
        .unwrap();

        let second = ModuleLock::acquire(
            &conn,
            "Assets",
            "region-server",
            Duration::from_millis(20),
            Duration::from_millis(5),
            &cancel,
        );
        assert!(matches!(second, Err(MigrationError::LockTimeout { .. })));
        assert_eq!(conn.lock_holder("Assets").unwrap().as_deref(), Some("region-server"));

        drop(first);
        assert_eq!(conn.lock_holder("Assets").unwrap(), None);
    }

    #[test]
    fn test_cancel_while_waiting() {
        let conn = SledConnector::temporary().unwrap();
        conn.try_lock_module("Assets", "other").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = ModuleLock::acquire(
            &conn,
            "Assets",
            "me",
            Duration::from_secs(5),
            Duration::from_millis(5),
            &cancel,
        );
        assert!(matches!(result, Err(MigrationError::Cancelled { .. })));
    }
}
