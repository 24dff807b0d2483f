//! Migration manager - plans and executes a module's migrations.

use super::cancel::CancelToken;
use super::config::MigrationConfig;
use super::error::MigrationError;
use super::ladder::{LadderState, RecoveryLadder};
use super::lock::ModuleLock;
use super::migrator::{Migrator, SchemaReport};
use super::operation::{MigrationOperationDescription, ModuleState, OperationType};
use super::registry::{sort_migrators, MigratorRegistry};
use super::report::{MigrationReport, StepKind};
use super::restore::RestorePoint;
use crate::connector::DataConnector;
use crate::version::Version;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Plans and executes migrations for one module.
///
/// `determine_operation` compares the persisted version with the module's
/// migrators and stores a [`MigrationOperationDescription`];
/// `execute_operation` consumes it. Execution holds the module's advisory
/// lock, runs the recovery ladder on the starting version, then walks the
/// upgrade migrators under a restore point.
pub struct MigrationManager {
    module: String,
    connector: Arc<dyn DataConnector>,
    migrators: Vec<Arc<dyn Migrator>>,
    latest: Version,
    config: MigrationConfig,
    cancel: CancelToken,
    operation: Option<MigrationOperationDescription>,
    observed_version: Option<Version>,
}

impl MigrationManager {
    /// Create a manager for a module registered in `registry`.
    pub fn new(
        module: impl Into<String>,
        connector: Arc<dyn DataConnector>,
        registry: &MigratorRegistry,
        config: MigrationConfig,
    ) -> Result<Self, MigrationError> {
        let module = module.into();
        let migrators = registry.migrators_for(&module)?;
        Self::with_migrators(module, connector, migrators, config)
    }

    /// Create a manager from an explicit migrator list.
    pub fn with_migrators(
        module: impl Into<String>,
        connector: Arc<dyn DataConnector>,
        migrators: Vec<Arc<dyn Migrator>>,
        config: MigrationConfig,
    ) -> Result<Self, MigrationError> {
        let module = module.into();
        config.validate()?;
        let migrators = sort_migrators(&module, migrators)?;
        let latest = migrators
            .last()
            .map(|m| *m.version())
            .ok_or_else(|| MigrationError::configuration(format!("module {} has no migrators", module)))?;

        Ok(Self {
            module,
            connector,
            migrators,
            latest,
            config,
            cancel: CancelToken::new(),
            operation: None,
            observed_version: None,
        })
    }

    /// Share a cancellation token with the host.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Module name.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Migrators, ascending by version.
    pub fn migrators(&self) -> &[Arc<dyn Migrator>] {
        &self.migrators
    }

    /// Version of the newest migrator.
    pub fn latest_version(&self) -> &Version {
        &self.latest
    }

    /// The pending operation, if one was determined and not yet executed.
    pub fn operation(&self) -> Option<&MigrationOperationDescription> {
        self.operation.as_ref()
    }

    /// Manager configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Token that cancels this manager's executions.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Version persisted for the module.
    pub fn persisted_version(&self) -> Result<Option<Version>, MigrationError> {
        Ok(self.connector.module_version(&self.module)?)
    }

    /// Where the persisted version stands relative to the migrators.
    pub fn state(&self) -> Result<ModuleState, MigrationError> {
        let persisted = self.persisted_version()?;
        Ok(ModuleState::classify(persisted.as_ref(), &self.latest))
    }

    /// The migrator a fresh install starts from.
    ///
    /// The newest migrator able to bootstrap, or the oldest migrator when
    /// none declares it.
    pub fn baseline(&self) -> Result<&Arc<dyn Migrator>, MigrationError> {
        self.migrators
            .iter()
            .rev()
            .find(|m| m.can_bootstrap())
            .or_else(|| self.migrators.first())
            .ok_or_else(|| MigrationError::configuration(format!("module {} has no migrators", self.module)))
    }

    /// Migrators newer than `version`.
    fn after(&self, version: &Version) -> &[Arc<dyn Migrator>] {
        let at = self.migrators.partition_point(|m| m.version() <= version);
        &self.migrators[at..]
    }

    /// Plan the operation for a module persisted at `persisted`.
    pub fn plan(&self, persisted: Option<&Version>) -> Result<MigrationOperationDescription, MigrationError> {
        let walk = |current: Version, operation_type: OperationType| {
            let span = self.after(&current);
            MigrationOperationDescription {
                operation_type,
                current_version: current,
                start_version: span.first().map(|m| *m.version()),
                end_version: span.last().map(|m| *m.version()),
                breaking_changes: span.iter().any(|m| m.breaking_changes()),
            }
        };

        match (ModuleState::classify(persisted, &self.latest), persisted) {
            (ModuleState::Unversioned, _) | (_, None) => {
                let baseline = *self.baseline()?.version();
                Ok(walk(baseline, OperationType::CreateDefaultAndUpgradeToTarget))
            }
            (ModuleState::Behind, Some(version)) => {
                if !self.migrators.iter().any(|m| m.version() == version) {
                    return Err(MigrationError::UnknownVersion {
                        module: self.module.clone(),
                        version: *version,
                    });
                }
                Ok(walk(*version, OperationType::UpgradeToTarget))
            }
            (ModuleState::Current, Some(version)) | (ModuleState::Ahead, Some(version)) => {
                Ok(MigrationOperationDescription::do_nothing(*version))
            }
        }
    }

    /// Inspect storage and store the operation to execute.
    #[instrument(skip(self), fields(module = %self.module))]
    pub fn determine_operation(&mut self) -> Result<&MigrationOperationDescription, MigrationError> {
        let persisted = self.persisted_version()?;
        let description = self.plan(persisted.as_ref())?;

        if let Some(version) = persisted.filter(|v| *v > self.latest) {
            warn!(
                persisted = %version,
                latest = %self.latest,
                "Module is newer than every known migrator, leaving it alone"
            );
        }
        info!(
            operation = %description.operation_type,
            plan = %description,
            "Determined migration operation"
        );

        self.observed_version = persisted;
        Ok(self.operation.insert(description))
    }

    /// Execute the determined operation.
    ///
    /// Returns immediately, without touching storage, when no operation is
    /// pending or it is `DoNothing`. The pending description is consumed.
    #[instrument(skip(self), fields(module = %self.module))]
    pub fn execute_operation(&mut self) -> Result<MigrationReport, MigrationError> {
        let Some(mut description) = self.operation.take() else {
            debug!("No pending migration operation");
            return Ok(self.idle_report());
        };
        if description.is_noop() {
            return Ok(self.idle_report());
        }

        let connector = Arc::clone(&self.connector);
        let conn = connector.as_ref();
        let cancel = self.cancel.with_timeout(self.config.operation_timeout);
        let planned_at = description.current_version;
        let _lock = ModuleLock::acquire(
            conn,
            &self.module,
            &self.config.lock_owner,
            self.config.lock_timeout,
            self.config.lock_poll_interval,
            &cancel,
        )
        .map_err(|e| e.at(&self.module, planned_at))?;

        let persisted = conn
            .module_version(&self.module)
            .map_err(|e| MigrationError::from(e).at(&self.module, planned_at))?;
        if persisted != self.observed_version {
            info!(
                persisted = %persisted.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string()),
                "Module version changed before the lock was taken, planning again"
            );
            description = self.plan(persisted.as_ref())?;
            self.observed_version = persisted;
            if description.is_noop() {
                return Ok(self.idle_report());
            }
        }

        let mut run = Execution {
            module: &self.module,
            conn,
            config: &self.config,
            cancel: &cancel,
            version: description.current_version,
            report: MigrationReport::new(&self.module, description.operation_type, persisted),
        };
        if let Err(e) = run.execute(&self.migrators, &description) {
            return Err(e.at(&self.module, run.version));
        }
        let mut report = run.report;

        report.to_version = conn
            .module_version(&self.module)
            .map_err(|e| MigrationError::from(e).at(&self.module, description.target_version()))?;
        self.observed_version = report.to_version;
        info!(
            from = %persisted.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string()),
            to = %report.to_version.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string()),
            steps = report.steps.len(),
            "Migration operation complete"
        );
        Ok(report)
    }

    /// Determine and execute in one call.
    pub fn migrate(&mut self) -> Result<MigrationReport, MigrationError> {
        self.determine_operation()?;
        self.execute_operation()
    }

    fn idle_report(&self) -> MigrationReport {
        MigrationReport::new(&self.module, OperationType::DoNothing, self.observed_version)
    }
}

/// State of one `execute_operation` call, held under the module lock.
struct Execution<'a> {
    module: &'a str,
    conn: &'a dyn DataConnector,
    config: &'a MigrationConfig,
    cancel: &'a CancelToken,
    /// Version being processed, for error context.
    version: Version,
    report: MigrationReport,
}

impl Execution<'_> {
    fn execute(
        &mut self,
        migrators: &[Arc<dyn Migrator>],
        description: &MigrationOperationDescription,
    ) -> Result<(), MigrationError> {
        let current = migrators
            .iter()
            .find(|m| *m.version() == description.current_version)
            .ok_or_else(|| MigrationError::UnknownVersion {
                module: self.module.to_string(),
                version: description.current_version,
            })?;

        if description.breaking_changes {
            warn!(
                module = %self.module,
                target = %description.target_version(),
                "Upgrade includes breaking changes"
            );
            self.report.warn(format!(
                "upgrade to {} includes breaking changes",
                description.target_version()
            ));
        }

        if description.operation_type == OperationType::CreateDefaultAndUpgradeToTarget {
            self.create_defaults(current.as_ref())?;
        }

        if self.config.validate_tables {
            self.stabilize(current.as_ref())?;
        }

        let (Some(start), Some(end)) = (description.start_version, description.end_version) else {
            return Ok(());
        };
        let span: Vec<&Arc<dyn Migrator>> = migrators
            .iter()
            .filter(|m| *m.version() >= start && *m.version() <= end)
            .collect();

        let restore = if self.config.validate_tables {
            self.cancel.check(self.module, "restore point")?;
            Some(self.prepare_restore_point(current.as_ref(), &span)?)
        } else {
            None
        };

        self.walk(&span, restore, end)
    }

    /// Install the baseline. Failures are logged and left to validation.
    fn create_defaults(&mut self, current: &dyn Migrator) -> Result<(), MigrationError> {
        self.cancel.check(self.module, "create defaults")?;
        let version = *current.version();
        let started = Instant::now();
        match current.create_defaults(self.conn) {
            Ok(()) => {
                info!(module = %self.module, %version, "Created default schema");
                self.report.record(StepKind::CreateDefaults, version, started, None);
            }
            Err(e) => {
                warn!(module = %self.module, %version, error = %e, "Creating defaults failed, continuing");
                self.report
                    .record_failure(StepKind::CreateDefaults, version, started, e.to_string());
                self.report
                    .warn(format!("creating defaults for {} failed: {}", version, e));
            }
        }
        Ok(())
    }

    /// Validate the starting version, climbing the recovery ladder on failure.
    fn stabilize(&mut self, current: &dyn Migrator) -> Result<(), MigrationError> {
        let version = *current.version();
        let mut ladder = RecoveryLadder::new();
        loop {
            self.cancel.check(self.module, "validation")?;
            let started = Instant::now();
            let checked = current.inspect(self.conn)?;

            match ladder.observe(checked.is_valid()) {
                LadderState::Validated => {
                    debug!(module = %self.module, %version, "Validated");
                    self.report.record(StepKind::Validate, version, started, None);
                    return Ok(());
                }
                LadderState::NeedsRetry => {
                    let problems = checked.summary();
                    warn!(module = %self.module, %version, %problems, "Validation failed, migrating again");
                    self.report
                        .record_failure(StepKind::Validate, version, started, problems);
                    self.retry(current)?;
                }
                LadderState::NeedsForceRename => {
                    let problems = checked.summary();
                    warn!(
                        module = %self.module,
                        %version,
                        %problems,
                        "Validation failed again, renaming mismatched tables"
                    );
                    self.report
                        .record_failure(StepKind::Validate, version, started, problems);
                    self.force_rename(version, &checked)?;
                    self.retry(current)?;
                }
                LadderState::Fatal => {
                    let details = checked.summary();
                    error!(module = %self.module, %version, problems = %details, "Validation failed after renaming tables");
                    self.report
                        .record_failure(StepKind::Validate, version, started, details.clone());
                    return Err(MigrationError::ValidationFailed {
                        module: self.module.to_string(),
                        version,
                        details,
                    });
                }
            }
        }
    }

    fn retry(&mut self, current: &dyn Migrator) -> Result<(), MigrationError> {
        self.cancel.check(self.module, "retry")?;
        let version = *current.version();
        let started = Instant::now();
        match current.migrate(self.conn) {
            Ok(()) => self.report.record(StepKind::Retry, version, started, None),
            Err(e) => {
                warn!(module = %self.module, %version, error = %e, "Migrating again failed");
                self.report
                    .record_failure(StepKind::Retry, version, started, e.to_string());
            }
        }
        Ok(())
    }

    /// Move every mismatched table to `<table><broken_suffix>`.
    fn force_rename(&mut self, version: Version, checked: &SchemaReport) -> Result<(), MigrationError> {
        self.cancel.check(self.module, "force rename")?;
        let started = Instant::now();
        let mut renamed = Vec::new();
        for table in checked.existing_mismatched_tables() {
            let broken = format!("{}{}", table, self.config.broken_suffix);
            if self.conn.table_exists(&broken)? {
                self.conn.drop_table(&broken)?;
            }
            self.conn.rename_table(table, &broken)?;
            warn!(module = %self.module, table, renamed_to = %broken, "Renamed mismatched table");
            renamed.push(broken);
        }
        self.report
            .record(StepKind::ForceRename, version, started, Some(renamed.join(", ")));
        Ok(())
    }

    fn prepare_restore_point(
        &mut self,
        current: &dyn Migrator,
        span: &[&Arc<dyn Migrator>],
    ) -> Result<RestorePoint, MigrationError> {
        let version = *current.version();
        let started = Instant::now();
        let mut point = current.prepare_restore_point(self.conn, &self.config.restore_suffix)?;
        for migrator in span {
            if let Err(e) = point.cover(self.conn, migrator.touched_tables()) {
                if let Err(clear) = point.clear(self.conn) {
                    warn!(module = %self.module, error = %clear, "Failed to drop partial restore point");
                }
                return Err(e.into());
            }
        }

        let backups = point.backups().count();
        info!(module = %self.module, %version, backups, "Prepared restore point");
        self.report.record(
            StepKind::RestorePoint,
            version,
            started,
            Some(format!("{} tables copied", backups)),
        );
        Ok(point)
    }

    /// Apply each migrator in `span`, validating after each one.
    fn walk(
        &mut self,
        span: &[&Arc<dyn Migrator>],
        restore: Option<RestorePoint>,
        end: Version,
    ) -> Result<(), MigrationError> {
        for migrator in span {
            let version = *migrator.version();
            self.version = version;
            if let Err(e) = self.cancel.check(self.module, &format!("upgrade to {}", version)) {
                return Err(self.abort(restore, version, e));
            }

            let started = Instant::now();
            if let Err(e) = migrator.migrate(self.conn) {
                error!(module = %self.module, %version, error = %e, "Migration failed");
                self.report
                    .record_failure(StepKind::Migrate, version, started, e.to_string());
                let err = MigrationError::Execution {
                    module: self.module.to_string(),
                    version,
                    reason: e.to_string(),
                };
                return Err(self.abort(restore, version, err));
            }
            self.report.record(StepKind::Migrate, version, started, None);

            if self.config.validate_tables {
                let started = Instant::now();
                let checked = match migrator.inspect(self.conn) {
                    Ok(checked) => checked,
                    Err(e) => return Err(self.abort(restore, version, e)),
                };
                if !checked.is_valid() {
                    let reason = checked.summary();
                    error!(
                        module = %self.module,
                        %version,
                        problems = %reason,
                        "Validation failed after migrating, rolling back"
                    );
                    self.report
                        .record_failure(StepKind::Validate, version, started, reason.clone());
                    return Err(self.rollback(restore, version, reason));
                }
                self.report.record(StepKind::Validate, version, started, None);
            }

            let started = Instant::now();
            if let Err(e) = migrator.finished_migration(self.conn) {
                error!(module = %self.module, %version, error = %e, "Post-migration hook failed");
                self.report
                    .record_failure(StepKind::FinishedMigration, version, started, e.to_string());
                let err = MigrationError::Execution {
                    module: self.module.to_string(),
                    version,
                    reason: format!("finished_migration: {}", e),
                };
                return Err(self.abort(restore, version, err));
            }
            self.report
                .record(StepKind::FinishedMigration, version, started, None);
            info!(module = %self.module, %version, "Applied migration");
        }

        if let Some(point) = restore {
            let started = Instant::now();
            match point.clear(self.conn) {
                Ok(()) => self
                    .report
                    .record(StepKind::ClearRestorePoint, end, started, None),
                Err(e) => {
                    warn!(module = %self.module, error = %e, "Failed to clear restore point");
                    self.report
                        .record_failure(StepKind::ClearRestorePoint, end, started, e.to_string());
                    self.report
                        .warn(format!("restore point tables were not dropped: {}", e));
                }
            }
        }
        Ok(())
    }

    /// Apply the restore point after a failed validation.
    fn rollback(&mut self, restore: Option<RestorePoint>, version: Version, reason: String) -> MigrationError {
        let Some(point) = restore else {
            return MigrationError::ValidationFailed {
                module: self.module.to_string(),
                version,
                details: reason,
            };
        };
        match self.restore(point, version) {
            Ok(()) => MigrationError::RolledBack {
                module: self.module.to_string(),
                version,
                reason,
            },
            Err(e) => MigrationError::RollbackFailed {
                module: self.module.to_string(),
                version,
                reason: format!("{}; restore failed: {}", reason, e),
            },
        }
    }

    /// Apply the restore point, if any, before returning `err`.
    fn abort(&mut self, restore: Option<RestorePoint>, version: Version, err: MigrationError) -> MigrationError {
        let Some(point) = restore else {
            return err;
        };
        match self.restore(point, version) {
            Ok(()) => err,
            Err(e) => MigrationError::RollbackFailed {
                module: self.module.to_string(),
                version,
                reason: format!("{}; restore failed: {}", err, e),
            },
        }
    }

    fn restore(&mut self, point: RestorePoint, version: Version) -> Result<(), crate::error::Error> {
        let started = Instant::now();
        match point.restore(self.conn) {
            Ok(()) => {
                error!(module = %self.module, %version, "Rolled back to restore point");
                self.report.record(StepKind::Rollback, version, started, None);
                Ok(())
            }
            Err(e) => {
                error!(
                    module = %self.module,
                    %version,
                    error = %e,
                    "Rollback failed, module data may be damaged"
                );
                self.report
                    .record_failure(StepKind::Rollback, version, started, e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SledConnector;
    use crate::migration::SchemaMigrator;
    use crate::schema::{ColumnDefinition, ColumnType, TableSchema};

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn assets(version: &str, bootstrap: bool, breaking: bool) -> Arc<dyn Migrator> {
        let mut builder = SchemaMigrator::builder("Assets", version).table(
            TableSchema::new("assets")
                .with_column(ColumnDefinition::new("id", ColumnType::Uuid).with_size(36)),
        );
        if bootstrap {
            builder = builder.bootstrap();
        }
        if breaking {
            builder = builder.breaking();
        }
        Arc::new(builder.build().unwrap())
    }

    fn manager(migrators: Vec<Arc<dyn Migrator>>) -> MigrationManager {
        let conn: Arc<dyn DataConnector> = Arc::new(SledConnector::temporary().unwrap());
        MigrationManager::with_migrators("Assets", conn, migrators, MigrationConfig::default()).unwrap()
    }

    #[test]
    fn test_plan_unversioned_from_lowest() {
        let m = manager(vec![
            assets("1.2", false, false),
            assets("1.0", false, false),
            assets("1.1", false, false),
        ]);
        let plan = m.plan(None).unwrap();
        assert_eq!(plan.operation_type, OperationType::CreateDefaultAndUpgradeToTarget);
        assert_eq!(plan.current_version, v("1.0"));
        assert_eq!(plan.start_version, Some(v("1.1")));
        assert_eq!(plan.end_version, Some(v("1.2")));
    }

    #[test]
    fn test_plan_unversioned_from_bootstrap() {
        let m = manager(vec![
            assets("1.0", true, false),
            assets("1.1", true, false),
            assets("1.2", false, true),
        ]);
        let plan = m.plan(None).unwrap();
        assert_eq!(plan.current_version, v("1.1"));
        assert_eq!(plan.start_version, Some(v("1.2")));
        assert!(plan.breaking_changes);

        let single = manager(vec![assets("1.0", false, false)]);
        let plan = single.plan(None).unwrap();
        assert_eq!(plan.operation_type, OperationType::CreateDefaultAndUpgradeToTarget);
        assert_eq!(plan.start_version, None);
        assert_eq!(plan.end_version, None);
    }

    #[test]
    fn test_plan_behind_current_ahead() {
        let m = manager(vec![
            assets("1.0", false, false),
            assets("1.1", false, false),
            assets("2.0", false, false),
        ]);

        let behind = m.plan(Some(&v("1.1"))).unwrap();
        assert_eq!(behind.operation_type, OperationType::UpgradeToTarget);
        assert_eq!(behind.start_version, Some(v("2.0")));
        assert_eq!(behind.end_version, Some(v("2.0")));

        assert!(m.plan(Some(&v("2.0"))).unwrap().is_noop());
        assert!(m.plan(Some(&v("3.0"))).unwrap().is_noop());

        assert!(matches!(
            m.plan(Some(&v("1.0.5"))),
            Err(MigrationError::UnknownVersion { .. })
        ));
    }

    #[test]
    fn test_execute_without_plan_is_noop() {
        let mut m = manager(vec![assets("1.0", false, false)]);
        let report = m.execute_operation().unwrap();
        assert_eq!(report.operation, OperationType::DoNothing);
        assert!(!report.did_work());
        assert_eq!(m.persisted_version().unwrap(), None);
    }

    #[test]
    fn test_description_is_consumed() {
        let mut m = manager(vec![assets("1.0", false, false), assets("1.1", false, false)]);
        m.determine_operation().unwrap();
        assert!(m.operation().is_some());

        let report = m.execute_operation().unwrap();
        assert!(m.operation().is_none());
        assert_eq!(report.to_version, Some(v("1.1")));
        assert_eq!(m.state().unwrap(), ModuleState::Current);

        let again = m.execute_operation().unwrap();
        assert!(!again.did_work());
    }

    #[test]
    fn test_rejects_empty_module() {
        let conn: Arc<dyn DataConnector> = Arc::new(SledConnector::temporary().unwrap());
        let result = MigrationManager::with_migrators("Assets", conn, Vec::new(), MigrationConfig::default());
        assert!(matches!(result, Err(MigrationError::Configuration { .. })));
    }
}
