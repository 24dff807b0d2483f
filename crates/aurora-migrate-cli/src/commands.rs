//! Subcommand execution.

use aurora_migrate_core::migration::{
    MigrationConfig, MigrationError, MigrationManager, MigrationOperationDescription,
    MigrationReport, MigratorRegistry, ModuleState,
};
use aurora_migrate_core::{DataConnector, SledConnector, Version};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Command errors.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Migration or manifest error.
    #[error("{0}")]
    Migration(#[from] MigrationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] aurora_migrate_core::Error),

    /// Module not present in any manifest.
    #[error("unknown module {0}")]
    UnknownModule(String),
}

/// Status of one module.
#[derive(Debug, Clone)]
pub struct ModuleStatus {
    /// Module name.
    pub module: String,
    /// Persisted version.
    pub persisted: Option<Version>,
    /// Newest registered version.
    pub latest: Version,
    /// Persisted version relative to the migrators.
    pub state: ModuleState,
    /// Current lock holder.
    pub lock_holder: Option<String>,
}

/// Reports of a `migrate` run and the error that stopped it, if any.
#[derive(Debug)]
pub struct MigrateOutcome {
    /// Reports of the modules migrated, in order.
    pub reports: Vec<MigrationReport>,
    /// The fatal error, if a module failed.
    pub error: Option<CommandError>,
}

/// Opened storage and loaded migrators.
pub struct Context {
    connector: Arc<SledConnector>,
    registry: MigratorRegistry,
    config: MigrationConfig,
}

impl Context {
    /// Open the data directory and load every manifest.
    pub fn open(
        data_dir: &Path,
        manifests: &[PathBuf],
        config: MigrationConfig,
    ) -> Result<Self, CommandError> {
        let mut registry = MigratorRegistry::new();
        for manifest in manifests {
            let count = registry.register_manifest(manifest)?;
            info!(manifest = %manifest.display(), migrators = count, "Loaded manifest");
        }
        let connector = Arc::new(SledConnector::open(data_dir)?);
        Ok(Self {
            connector,
            registry,
            config,
        })
    }

    /// Use an already opened connector.
    pub fn with_connector(
        connector: Arc<SledConnector>,
        registry: MigratorRegistry,
        config: MigrationConfig,
    ) -> Self {
        Self {
            connector,
            registry,
            config,
        }
    }

    /// Storage connector.
    pub fn connector(&self) -> &SledConnector {
        &self.connector
    }

    /// The selected module, or every registered module.
    fn modules(&self, only: Option<&str>) -> Result<Vec<String>, CommandError> {
        match only {
            Some(module) if self.registry.contains(module) => Ok(vec![module.to_string()]),
            Some(module) => Err(CommandError::UnknownModule(module.to_string())),
            None => Ok(self.registry.modules().map(str::to_string).collect()),
        }
    }

    fn manager(&self, module: &str) -> Result<MigrationManager, CommandError> {
        let connector: Arc<dyn DataConnector> = self.connector.clone();
        Ok(MigrationManager::new(
            module,
            connector,
            &self.registry,
            self.config.clone(),
        )?)
    }

    /// Persisted and latest version of every module.
    pub fn status(&self) -> Result<Vec<ModuleStatus>, CommandError> {
        let mut out = Vec::new();
        for module in self.modules(None)? {
            let manager = self.manager(&module)?;
            let persisted = manager.persisted_version()?;
            let latest = *manager.latest_version();
            out.push(ModuleStatus {
                state: ModuleState::classify(persisted.as_ref(), &latest),
                lock_holder: self.connector.lock_holder(&module)?,
                module,
                persisted,
                latest,
            });
        }
        Ok(out)
    }

    /// The operation each module would execute.
    pub fn plan(
        &self,
        only: Option<&str>,
    ) -> Result<Vec<(String, MigrationOperationDescription)>, CommandError> {
        let mut out = Vec::new();
        for module in self.modules(only)? {
            let manager = self.manager(&module)?;
            let persisted = manager.persisted_version()?;
            out.push((module, manager.plan(persisted.as_ref())?));
        }
        Ok(out)
    }

    /// Migrate each module in turn, stopping at the first failure.
    pub fn migrate(&self, only: Option<&str>) -> MigrateOutcome {
        let mut reports = Vec::new();
        let modules = match self.modules(only) {
            Ok(modules) => modules,
            Err(e) => {
                return MigrateOutcome {
                    reports,
                    error: Some(e),
                }
            }
        };

        for module in modules {
            let result = self
                .manager(&module)
                .and_then(|mut manager| Ok(manager.migrate()?));
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    return MigrateOutcome {
                        reports,
                        error: Some(e),
                    }
                }
            }
        }
        if let Err(e) = self.connector.flush() {
            return MigrateOutcome {
                reports,
                error: Some(e.into()),
            };
        }
        MigrateOutcome {
            reports,
            error: None,
        }
    }

    /// Release a module's lock whoever holds it. Returns the previous holder.
    pub fn unlock(&self, module: &str) -> Result<Option<String>, CommandError> {
        let holder = self.connector.lock_holder(module)?;
        if self.connector.force_unlock_module(module)? {
            info!(module, holder = ?holder, "Force-released migration lock");
        }
        Ok(holder)
    }
}
