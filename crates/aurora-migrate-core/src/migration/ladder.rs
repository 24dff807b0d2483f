//! Recovery ladder for a migrator that fails validation.

use std::fmt;

/// Next action after a validation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderState {
    /// The schema is valid.
    Validated,
    /// Re-run the migrator and validate again.
    NeedsRetry,
    /// Rename mismatched tables out of the way, re-run and validate again.
    NeedsForceRename,
    /// Give up.
    Fatal,
}

impl fmt::Display for LadderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LadderState::Validated => write!(f, "validated"),
            LadderState::NeedsRetry => write!(f, "needs_retry"),
            LadderState::NeedsForceRename => write!(f, "needs_force_rename"),
            LadderState::Fatal => write!(f, "fatal"),
        }
    }
}

/// Counts failed validations of one migrator and picks the next rung.
#[derive(Debug, Clone, Default)]
pub struct RecoveryLadder {
    failures: u8,
}

impl RecoveryLadder {
    /// Create a ladder with no failures recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a validation result and return the next state.
    pub fn observe(&mut self, valid: bool) -> LadderState {
        if valid {
            return LadderState::Validated;
        }
        self.failures = self.failures.saturating_add(1);
        match self.failures {
            1 => LadderState::NeedsRetry,
            2 => LadderState::NeedsForceRename,
            _ => LadderState::Fatal,
        }
    }

    /// Number of failed validations so far.
    pub fn failures(&self) -> u8 {
        self.failures
    }
}
