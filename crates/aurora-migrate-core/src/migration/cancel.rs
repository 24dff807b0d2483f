//! Cooperative cancellation for migration executions.

use super::error::MigrationError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation flag shared between a host and a running migration.
///
/// Clones share the flag. The manager checks the token between steps; a
/// step already running is allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token sharing this flag that also expires after `timeout`.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clear a previous cancellation request.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation was requested or the deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with [`MigrationError::Cancelled`] if the token tripped.
    pub fn check(&self, module: &str, stage: &str) -> Result<(), MigrationError> {
        if self.is_cancelled() {
            return Err(MigrationError::Cancelled {
                module: module.to_string(),
                stage: stage.to_string(),
            });
        }
        Ok(())
    }
}
