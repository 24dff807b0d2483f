//! Migration orchestration for independently versioned modules.
//!
//! This module provides:
//! - The [`Migrator`] contract, one implementation per schema version
//! - A declarative [`SchemaMigrator`] and JSON manifests for it
//! - The [`MigrationManager`] state machine that plans and executes upgrades
//! - A recovery ladder, restore points, a per-module lock and cancellation
//!
//! # Operations
//!
//! | Persisted version | Operation | Walk |
//! |-------------------|-----------|------|
//! | none | `CreateDefaultAndUpgradeToTarget` | baseline, then every newer migrator |
//! | older than latest | `UpgradeToTarget` | every migrator newer than the persisted one |
//! | latest or newer | `DoNothing` | none |
//!
//! # Example
//!
//! ```ignore
//! use aurora_migrate_core::migration::{MigrationConfig, MigrationManager, MigratorRegistry};
//!
//! let mut registry = MigratorRegistry::new();
//! registry.register_manifest("migrations/estates.json")?;
//!
//! let mut manager = MigrationManager::new("Estates", connector, &registry, MigrationConfig::default())?;
//! let report = manager.migrate()?;
//! println!("{} -> {:?}", report.module, report.to_version);
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod ladder;
pub mod lock;
pub mod manager;
pub mod manifest;
pub mod migrator;
pub mod operation;
pub mod registry;
pub mod report;
pub mod restore;
pub mod schema_migrator;

pub use cancel::CancelToken;
pub use config::MigrationConfig;
pub use error::MigrationError;
pub use ladder::{LadderState, RecoveryLadder};
pub use lock::ModuleLock;
pub use manager::MigrationManager;
pub use manifest::{load_manifest, parse_manifest, MigratorManifest};
pub use migrator::{check_tables, ensure_tables, Migrator, SchemaReport, TableMismatch};
pub use operation::{MigrationOperationDescription, ModuleState, OperationType};
pub use registry::MigratorRegistry;
pub use report::{MigrationReport, StepKind, StepOutcome, StepStatus};
pub use restore::RestorePoint;
pub use schema_migrator::{SchemaMigrator, SchemaMigratorBuilder};
