//! Planned migration operations.

use crate::version::Version;
use std::fmt;

/// What the manager will do for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Fresh install from the baseline, then upgrade to the latest version.
    CreateDefaultAndUpgradeToTarget,
    /// Upgrade from the persisted version to the latest version.
    UpgradeToTarget,
    /// Nothing to do.
    DoNothing,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::CreateDefaultAndUpgradeToTarget => write!(f, "create_defaults_and_upgrade"),
            OperationType::UpgradeToTarget => write!(f, "upgrade"),
            OperationType::DoNothing => write!(f, "do_nothing"),
        }
    }
}

/// Where a module's persisted version stands relative to its migrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// No version persisted yet.
    Unversioned,
    /// Persisted version is older than the latest migrator.
    Behind,
    /// Persisted version is the latest migrator's.
    Current,
    /// Persisted version is newer than every migrator.
    Ahead,
}

impl ModuleState {
    /// Classify `persisted` against the latest known version.
    pub fn classify(persisted: Option<&Version>, latest: &Version) -> Self {
        match persisted {
            None => ModuleState::Unversioned,
            Some(v) if v < latest => ModuleState::Behind,
            Some(v) if v == latest => ModuleState::Current,
            Some(_) => ModuleState::Ahead,
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Unversioned => write!(f, "unversioned"),
            ModuleState::Behind => write!(f, "behind"),
            ModuleState::Current => write!(f, "current"),
            ModuleState::Ahead => write!(f, "ahead"),
        }
    }
}

/// A planned operation for one module.
///
/// `current_version` is the version the module is treated as being at when
/// execution starts; `start_version` and `end_version` bound the upgrade
/// walk and are both `None` when there is nothing to walk.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MigrationOperationDescription {
    /// Operation kind.
    pub operation_type: OperationType,
    /// Version the walk starts from.
    pub current_version: Version,
    /// First migrator applied by the walk.
    pub start_version: Option<Version>,
    /// Last migrator applied by the walk.
    pub end_version: Option<Version>,
    /// Whether any migrator in the walk is flagged as breaking.
    pub breaking_changes: bool,
}

impl MigrationOperationDescription {
    /// An operation that does nothing for a module at `current`.
    pub fn do_nothing(current: Version) -> Self {
        Self {
            operation_type: OperationType::DoNothing,
            current_version: current,
            start_version: None,
            end_version: None,
            breaking_changes: false,
        }
    }

    /// Whether executing this description has any effect.
    pub fn is_noop(&self) -> bool {
        self.operation_type == OperationType::DoNothing
    }

    /// Version the module ends at once executed.
    pub fn target_version(&self) -> Version {
        self.end_version.unwrap_or(self.current_version)
    }
}

impl fmt::Display for MigrationOperationDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.operation_type, &self.start_version, &self.end_version) {
            (OperationType::DoNothing, _, _) => write!(f, "nothing to do at {}", self.current_version),
            (OperationType::CreateDefaultAndUpgradeToTarget, None, _) => {
                write!(f, "create {}", self.current_version)
            }
            (OperationType::CreateDefaultAndUpgradeToTarget, Some(start), end) => write!(
                f,
                "create {}, upgrade {} to {}",
                self.current_version,
                start,
                end.unwrap_or(*start)
            ),
            (OperationType::UpgradeToTarget, start, end) => {
                write!(f, "upgrade {}", self.current_version)?;
                if let (Some(start), Some(end)) = (start, end) {
                    write!(f, " via {} to {}", start, end)?;
                }
                Ok(())
            }
        }
    }
}
