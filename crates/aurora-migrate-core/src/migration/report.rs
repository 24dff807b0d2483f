//! Reporting of executed migration operations.

use super::operation::OperationType;
use crate::version::Version;
use std::fmt;
use std::time::{Duration, Instant};

/// Kind of step the manager performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Fresh install of the baseline version.
    CreateDefaults,
    /// Validation of a version.
    Validate,
    /// Re-run of a migrator that failed validation.
    Retry,
    /// Mismatched tables renamed out of the way.
    ForceRename,
    /// Snapshot taken before the upgrade walk.
    RestorePoint,
    /// Upgrade to a version.
    Migrate,
    /// Post-migration hook.
    FinishedMigration,
    /// Restore point applied after a failure.
    Rollback,
    /// Snapshot tables dropped.
    ClearRestorePoint,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::CreateDefaults => write!(f, "create_defaults"),
            StepKind::Validate => write!(f, "validate"),
            StepKind::Retry => write!(f, "retry"),
            StepKind::ForceRename => write!(f, "force_rename"),
            StepKind::RestorePoint => write!(f, "restore_point"),
            StepKind::Migrate => write!(f, "migrate"),
            StepKind::FinishedMigration => write!(f, "finished_migration"),
            StepKind::Rollback => write!(f, "rollback"),
            StepKind::ClearRestorePoint => write!(f, "clear_restore_point"),
        }
    }
}

/// Status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step completed successfully.
    Complete,
    /// Step failed.
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Complete => write!(f, "complete"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One step of an executed operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepOutcome {
    /// What was done.
    pub kind: StepKind,
    /// Version the step concerned.
    pub version: Version,
    /// How it ended.
    pub status: StepStatus,
    /// How long it took.
    pub duration: Duration,
    /// Error or note.
    pub detail: Option<String>,
}

/// Result of executing a migration operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationReport {
    /// Module name.
    pub module: String,
    /// Operation that was executed.
    pub operation: OperationType,
    /// Persisted version before execution.
    pub from_version: Option<Version>,
    /// Persisted version after execution.
    pub to_version: Option<Version>,
    /// Steps performed, in order.
    pub steps: Vec<StepOutcome>,
    /// Any warnings generated.
    pub warnings: Vec<String>,
}

impl MigrationReport {
    /// Create an empty report.
    pub fn new(module: impl Into<String>, operation: OperationType, from: Option<Version>) -> Self {
        Self {
            module: module.into(),
            operation,
            from_version: from,
            to_version: from,
            steps: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Record a finished step started at `started`.
    pub fn record(
        &mut self,
        kind: StepKind,
        version: Version,
        started: Instant,
        detail: Option<String>,
    ) {
        self.push(kind, version, StepStatus::Complete, started, detail);
    }

    /// Record a failed step started at `started`.
    pub fn record_failure(
        &mut self,
        kind: StepKind,
        version: Version,
        started: Instant,
        error: impl Into<String>,
    ) {
        self.push(kind, version, StepStatus::Failed, started, Some(error.into()));
    }

    fn push(
        &mut self,
        kind: StepKind,
        version: Version,
        status: StepStatus,
        started: Instant,
        detail: Option<String>,
    ) {
        self.steps.push(StepOutcome {
            kind,
            version,
            status,
            duration: started.elapsed(),
            detail,
        });
    }

    /// Add a warning.
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Versions applied by `Migrate` steps, in order.
    pub fn migrated_versions(&self) -> Vec<Version> {
        self.steps
            .iter()
            .filter(|s| s.kind == StepKind::Migrate && s.status == StepStatus::Complete)
            .map(|s| s.version)
            .collect()
    }

    /// Whether any step ran.
    pub fn did_work(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Total time spent in recorded steps.
    pub fn total_duration(&self) -> Duration {
        self.steps.iter().map(|s| s.duration).sum()
    }
}
