//! End-to-end tests of the migration manager against the sled connector.

use aurora_migrate_core::connector::{ColumnRenames, DataConnector, Filter, SledConnector};
use aurora_migrate_core::migration::{
    ensure_tables, CancelToken, MigrationConfig, MigrationError, MigrationManager, Migrator,
    MigratorRegistry, OperationType, SchemaMigrator, StepKind,
};
use aurora_migrate_core::schema::{ColumnDefinition, ColumnType, IndexDefinition, TableSchema};
use aurora_migrate_core::value::{row, Row, Value};
use aurora_migrate_core::version::Version;
use aurora_migrate_core::Error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MODULE: &str = "Regions";

fn v(s: &str) -> Version {
    Version::parse(s).unwrap()
}

fn regions_table(extra: &[&str]) -> TableSchema {
    let mut table = TableSchema::new("regions")
        .with_column(ColumnDefinition::new("uuid", ColumnType::Uuid).with_size(36))
        .with_column(ColumnDefinition::new("regionName", ColumnType::String).with_size(128))
        .with_index(IndexDefinition::primary(["uuid"]));
    for column in extra {
        table = table.with_column(ColumnDefinition::nullable(*column, ColumnType::Integer));
    }
    table
}

fn settings_table() -> TableSchema {
    TableSchema::new("regionsettings")
        .with_column(ColumnDefinition::new("regionUUID", ColumnType::Uuid).with_size(36))
        .with_column(ColumnDefinition::new("maturity", ColumnType::Integer).with_default("1"))
        .with_index(IndexDefinition::primary(["regionUUID"]))
}

fn region_row(uuid: &str, name: &str) -> Row {
    row([("uuid", Value::from(uuid)), ("regionName", Value::from(name))])
}

/// Three schema-driven versions: 1.0 creates `regions`, 1.1 adds a column,
/// 1.2 adds `regionsettings`.
fn standard_migrators() -> Vec<Arc<dyn Migrator>> {
    vec![
        Arc::new(
            SchemaMigrator::builder(MODULE, "1.0")
                .table(regions_table(&[]))
                .default_row("regions", region_row("00000000-0000-0000-0000-000000000001", "Welcome"))
                .build()
                .unwrap(),
        ),
        Arc::new(
            SchemaMigrator::builder(MODULE, "1.1")
                .table(regions_table(&["sizeX"]))
                .build()
                .unwrap(),
        ),
        Arc::new(
            SchemaMigrator::builder(MODULE, "1.2")
                .table(regions_table(&["sizeX"]))
                .table(settings_table())
                .build()
                .unwrap(),
        ),
    ]
}

fn test_config() -> MigrationConfig {
    MigrationConfig::default()
        .with_lock_timeout(Duration::from_millis(50))
        .with_lock_poll_interval(Duration::from_millis(5))
        .with_lock_owner("test-host")
}

fn manager(conn: Arc<dyn DataConnector>, migrators: Vec<Arc<dyn Migrator>>) -> MigrationManager {
    MigrationManager::with_migrators(MODULE, conn, migrators, test_config()).unwrap()
}

/// How a [`Scripted`] migrator's `do_migrate` behaves.
#[derive(Clone, Copy)]
enum Behavior {
    /// Create or alter tables to match.
    Normal,
    /// Create missing tables but never alter existing ones.
    CreateOnly,
    /// Touch nothing.
    Nothing,
    /// Fail.
    Fail,
}

/// Test migrator with programmable behaviour.
struct Scripted {
    version: Version,
    tables: Vec<TableSchema>,
    behavior: Behavior,
    fail_defaults: bool,
    finished: Arc<AtomicUsize>,
    cancel_when_finished: Option<CancelToken>,
}

impl Scripted {
    fn new(version: &str, tables: Vec<TableSchema>, behavior: Behavior) -> Self {
        Self {
            version: v(version),
            tables,
            behavior,
            fail_defaults: false,
            finished: Arc::new(AtomicUsize::new(0)),
            cancel_when_finished: None,
        }
    }
}

impl Migrator for Scripted {
    fn name(&self) -> &str {
        MODULE
    }

    fn version(&self) -> &Version {
        &self.version
    }

    fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    fn do_migrate(&self, conn: &dyn DataConnector) -> Result<(), MigrationError> {
        match self.behavior {
            Behavior::Normal => ensure_tables(conn, &self.tables, |_| ColumnRenames::new()),
            Behavior::CreateOnly => {
                for table in &self.tables {
                    if !conn.table_exists(&table.name)? {
                        conn.create_table(&table.name, &table.columns, &table.indices)?;
                    }
                }
                Ok(())
            }
            Behavior::Nothing => Ok(()),
            Behavior::Fail => Err(MigrationError::Hook("disk quota exceeded".to_string())),
        }
    }

    fn do_create_defaults(&self, conn: &dyn DataConnector) -> Result<(), MigrationError> {
        if self.fail_defaults {
            return Err(MigrationError::Hook("default data unavailable".to_string()));
        }
        self.do_migrate(conn)
    }

    fn finished_migration(&self, _conn: &dyn DataConnector) -> Result<(), MigrationError> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_when_finished {
            token.cancel();
        }
        Ok(())
    }
}

/// Connector wrapper counting every call, and the calls that write.
/// Table renames and copies can be made to fail.
struct Counting {
    inner: SledConnector,
    calls: AtomicUsize,
    writes: AtomicUsize,
    fail_renames: AtomicBool,
    fail_copies: AtomicBool,
}

impl Counting {
    fn new() -> Self {
        Self {
            inner: SledConnector::temporary().unwrap(),
            calls: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_renames: AtomicBool::new(false),
            fail_copies: AtomicBool::new(false),
        }
    }

    fn injected(flag: &AtomicBool, operation: &str) -> Result<(), Error> {
        if flag.load(Ordering::SeqCst) {
            return Err(Error::InvalidData(format!("{} failed: device offline", operation)));
        }
        Ok(())
    }

    fn read(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }
}

impl DataConnector for Counting {
    fn table_exists(&self, name: &str) -> Result<bool, Error> {
        self.read();
        self.inner.table_exists(name)
    }

    fn describe_table(&self, name: &str) -> Result<Option<TableSchema>, Error> {
        self.read();
        self.inner.describe_table(name)
    }

    fn list_tables(&self) -> Result<Vec<String>, Error> {
        self.read();
        self.inner.list_tables()
    }

    fn create_table(
        &self,
        name: &str,
        columns: &[ColumnDefinition],
        indices: &[IndexDefinition],
    ) -> Result<(), Error> {
        self.write();
        self.inner.create_table(name, columns, indices)
    }

    fn update_table(
        &self,
        name: &str,
        columns: &[ColumnDefinition],
        indices: &[IndexDefinition],
        renames: &ColumnRenames,
    ) -> Result<(), Error> {
        self.write();
        self.inner.update_table(name, columns, indices, renames)
    }

    fn rename_table(&self, old: &str, new: &str) -> Result<(), Error> {
        self.write();
        Self::injected(&self.fail_renames, "rename")?;
        self.inner.rename_table(old, new)
    }

    fn drop_table(&self, name: &str) -> Result<(), Error> {
        self.write();
        self.inner.drop_table(name)
    }

    fn copy_table(&self, from: &str, to: &str) -> Result<(), Error> {
        self.write();
        Self::injected(&self.fail_copies, "copy")?;
        self.inner.copy_table(from, to)
    }

    fn module_version(&self, module: &str) -> Result<Option<Version>, Error> {
        self.read();
        self.inner.module_version(module)
    }

    fn write_module_version(&self, module: &str, version: &Version) -> Result<(), Error> {
        self.write();
        self.inner.write_module_version(module, version)
    }

    fn try_lock_module(&self, module: &str, owner: &str) -> Result<bool, Error> {
        self.write();
        self.inner.try_lock_module(module, owner)
    }

    fn unlock_module(&self, module: &str, owner: &str) -> Result<bool, Error> {
        self.write();
        self.inner.unlock_module(module, owner)
    }

    fn force_unlock_module(&self, module: &str) -> Result<bool, Error> {
        self.write();
        self.inner.force_unlock_module(module)
    }

    fn lock_holder(&self, module: &str) -> Result<Option<String>, Error> {
        self.read();
        self.inner.lock_holder(module)
    }

    fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, Error> {
        self.read();
        self.inner.query(table, filter)
    }

    fn insert(&self, table: &str, row: Row) -> Result<(), Error> {
        self.write();
        self.inner.insert(table, row)
    }

    fn update(&self, table: &str, filter: &Filter, changes: &Row) -> Result<usize, Error> {
        self.write();
        self.inner.update(table, filter, changes)
    }

    fn delete(&self, table: &str, filter: &Filter) -> Result<usize, Error> {
        self.write();
        self.inner.delete(table, filter)
    }
}

#[test]
fn test_fresh_module_creates_and_upgrades() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    let mut m = manager(conn.clone(), standard_migrators());

    let plan = m.determine_operation().unwrap().clone();
    assert_eq!(plan.operation_type, OperationType::CreateDefaultAndUpgradeToTarget);
    assert_eq!(plan.current_version, v("1.0"));
    assert_eq!(plan.start_version, Some(v("1.1")));
    assert_eq!(plan.end_version, Some(v("1.2")));

    let report = m.execute_operation().unwrap();
    assert_eq!(report.from_version, None);
    assert_eq!(report.to_version, Some(v("1.2")));
    assert_eq!(report.migrated_versions(), vec![v("1.1"), v("1.2")]);
    assert_eq!(report.steps[0].kind, StepKind::CreateDefaults);

    assert_eq!(conn.module_version(MODULE).unwrap(), Some(v("1.2")));
    assert_eq!(
        conn.list_tables().unwrap(),
        vec!["regions".to_string(), "regionsettings".to_string()]
    );
    // Default row survived the 1.1 column addition.
    let rows = conn.query("regions", &Filter::all()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("sizeX"), Some(&Value::Null));
    assert_eq!(conn.lock_holder(MODULE).unwrap(), None);
}

#[test]
fn test_up_to_date_module_does_nothing_without_writes() {
    let conn = Arc::new(Counting::new());
    let migrators: Vec<Arc<dyn Migrator>> = vec![
        Arc::new(SchemaMigrator::builder(MODULE, "1.0").table(regions_table(&[])).build().unwrap()),
        Arc::new(SchemaMigrator::builder(MODULE, "2.0").table(regions_table(&["sizeY"])).build().unwrap()),
    ];
    let mut m = manager(conn.clone(), migrators);
    m.migrate().unwrap();
    assert_eq!(conn.inner.module_version(MODULE).unwrap(), Some(v("2.0")));

    for _ in 0..2 {
        conn.reset();
        let plan = m.determine_operation().unwrap();
        assert_eq!(plan.operation_type, OperationType::DoNothing);
        assert_eq!(conn.writes.load(Ordering::SeqCst), 0);

        conn.reset();
        let report = m.execute_operation().unwrap();
        assert_eq!(report.operation, OperationType::DoNothing);
        assert!(!report.did_work());
        assert_eq!(conn.calls.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn test_behind_module_upgrades_monotonically() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    let migrators = standard_migrators();
    migrators[0].create_defaults(&*conn).unwrap();

    let mut m = manager(conn.clone(), migrators);
    let plan = m.determine_operation().unwrap().clone();
    assert_eq!(plan.operation_type, OperationType::UpgradeToTarget);
    assert_eq!(plan.current_version, v("1.0"));

    let before = conn.module_version(MODULE).unwrap();
    let report = m.execute_operation().unwrap();
    let after = conn.module_version(MODULE).unwrap();
    assert!(after > before);
    assert_eq!(report.to_version, Some(v("1.2")));

    // No restore point tables are left behind.
    assert!(conn.list_tables().unwrap().iter().all(|t| !t.ends_with("_restore")));
    assert!(report.steps.iter().any(|s| s.kind == StepKind::ClearRestorePoint));
}

#[test]
fn test_forced_rename_recovers_broken_table() {
    let conn = Arc::new(SledConnector::temporary().unwrap());

    // Storage claims 1.0 but the table has a shape 1.0 never declared.
    let wrong = TableSchema::new("regions")
        .with_column(ColumnDefinition::new("uuid", ColumnType::Uuid).with_size(36))
        .with_column(ColumnDefinition::nullable("legacy", ColumnType::Text));
    conn.create_table(&wrong.name, &wrong.columns, &wrong.indices).unwrap();
    conn.insert("regions", row([("uuid", Value::from("r1")), ("legacy", Value::from("keep me"))]))
        .unwrap();
    conn.write_module_version(MODULE, &v("1.0")).unwrap();

    // A stale copy from an earlier recovery.
    conn.create_table("regions_broken", &wrong.columns, &[]).unwrap();

    let migrators: Vec<Arc<dyn Migrator>> = vec![
        Arc::new(Scripted::new("1.0", vec![regions_table(&[])], Behavior::CreateOnly)),
        Arc::new(Scripted::new("1.1", vec![regions_table(&["sizeX"])], Behavior::Normal)),
    ];
    let mut m = manager(conn.clone(), migrators);
    let report = m.migrate().unwrap();

    let kinds: Vec<StepKind> = report.steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        &kinds[..6],
        &[
            StepKind::Validate,
            StepKind::Retry,
            StepKind::Validate,
            StepKind::ForceRename,
            StepKind::Retry,
            StepKind::Validate,
        ]
    );
    assert_eq!(report.to_version, Some(v("1.1")));

    // The mismatched table and its data moved aside; the stale copy is gone.
    let broken = conn.query("regions_broken", &Filter::all()).unwrap();
    assert_eq!(broken.len(), 1);
    assert_eq!(broken[0].get("legacy"), Some(&Value::from("keep me")));
    assert_eq!(
        conn.describe_table("regions").unwrap().unwrap().differences(&regions_table(&["sizeX"])),
        Vec::<String>::new()
    );
}

#[test]
fn test_failing_ladder_is_fatal() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    conn.write_module_version(MODULE, &v("1.0")).unwrap();

    let migrators: Vec<Arc<dyn Migrator>> = vec![
        Arc::new(Scripted::new("1.0", vec![regions_table(&[])], Behavior::Nothing)),
        Arc::new(Scripted::new("1.1", vec![regions_table(&["sizeX"])], Behavior::Normal)),
    ];
    let mut m = manager(conn.clone(), migrators);
    let err = m.migrate().unwrap_err();
    match err {
        MigrationError::ValidationFailed { module, version, details } => {
            assert_eq!(module, MODULE);
            assert_eq!(version, v("1.0"));
            assert!(details.contains("regions"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(conn.module_version(MODULE).unwrap(), Some(v("1.0")));
    assert_eq!(conn.lock_holder(MODULE).unwrap(), None);
}

#[test]
fn test_failed_upgrade_validation_restores_pre_image() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    let v1 = Scripted::new("1.0", vec![regions_table(&[])], Behavior::Normal);
    v1.migrate(&*conn).unwrap();
    conn.insert("regions", region_row("r1", "Sandbox")).unwrap();
    conn.insert("regions", region_row("r2", "Plaza")).unwrap();

    let before_tables = conn.list_tables().unwrap();
    let before_schema = conn.describe_table("regions").unwrap();
    let before_rows = conn.query("regions", &Filter::all()).unwrap();

    let v2 = Scripted::new("2.0", vec![regions_table(&["sizeX"]), settings_table()], Behavior::Normal);
    let v2_finished = v2.finished.clone();
    // Declares a column its migration never adds.
    let v3 = Scripted::new("3.0", vec![regions_table(&["sizeX", "sizeY"]), settings_table()], Behavior::Nothing);
    let v3_finished = v3.finished.clone();

    let migrators: Vec<Arc<dyn Migrator>> = vec![Arc::new(v1), Arc::new(v2), Arc::new(v3)];
    let mut m = manager(conn.clone(), migrators);
    let err = m.migrate().unwrap_err();

    match &err {
        MigrationError::RolledBack { version, reason, .. } => {
            assert_eq!(*version, v("3.0"));
            assert!(reason.contains("sizeY"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_consistent());
    assert_eq!(v2_finished.load(Ordering::SeqCst), 1);
    assert_eq!(v3_finished.load(Ordering::SeqCst), 0);

    assert_eq!(conn.module_version(MODULE).unwrap(), Some(v("1.0")));
    assert_eq!(conn.list_tables().unwrap(), before_tables);
    assert_eq!(conn.describe_table("regions").unwrap(), before_schema);
    assert_eq!(conn.query("regions", &Filter::all()).unwrap(), before_rows);
    assert_eq!(conn.lock_holder(MODULE).unwrap(), None);
}

#[test]
fn test_failed_migrate_restores_and_reports_version() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    let migrators = standard_migrators();
    migrators[0].create_defaults(&*conn).unwrap();

    let broken: Arc<dyn Migrator> = Arc::new(Scripted::new(
        "1.2",
        vec![regions_table(&["sizeX"]), settings_table()],
        Behavior::Fail,
    ));
    let mut m = manager(conn.clone(), vec![migrators[0].clone(), migrators[1].clone(), broken]);
    let err = m.migrate().unwrap_err();

    match err {
        MigrationError::Execution { version, reason, .. } => {
            assert_eq!(version, v("1.2"));
            assert!(reason.contains("disk quota exceeded"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // 1.1 was applied, then rolled back with the rest of the walk.
    assert_eq!(conn.module_version(MODULE).unwrap(), Some(v("1.0")));
    assert_eq!(
        conn.describe_table("regions").unwrap().unwrap().differences(&regions_table(&[])),
        Vec::<String>::new()
    );
    assert!(conn.list_tables().unwrap().iter().all(|t| !t.ends_with("_restore")));
}

#[test]
fn test_rollback_drops_tables_created_by_renames() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    let v1: Arc<dyn Migrator> = Arc::new(
        SchemaMigrator::builder(MODULE, "1.0").table(regions_table(&[])).build().unwrap(),
    );
    v1.create_defaults(&*conn).unwrap();
    conn.insert("regions", region_row("r1", "Sandbox")).unwrap();
    let before_tables = conn.list_tables().unwrap();
    let before_rows = conn.query("regions", &Filter::all()).unwrap();

    let v2: Arc<dyn Migrator> = Arc::new(
        SchemaMigrator::builder(MODULE, "2.0")
            .rename_table("regions", "regions_archive")
            .table(settings_table())
            .build()
            .unwrap(),
    );
    // Declares a table its migration never creates.
    let extra = TableSchema::new("regionextras")
        .with_column(ColumnDefinition::new("regionUUID", ColumnType::Uuid).with_size(36));
    let v3: Arc<dyn Migrator> =
        Arc::new(Scripted::new("3.0", vec![settings_table(), extra], Behavior::Nothing));

    let mut m = manager(conn.clone(), vec![v1, v2, v3]);
    let err = m.migrate().unwrap_err();
    assert!(matches!(err, MigrationError::RolledBack { .. }), "{err}");

    assert_eq!(conn.module_version(MODULE).unwrap(), Some(v("1.0")));
    assert_eq!(conn.list_tables().unwrap(), before_tables);
    assert_eq!(conn.query("regions", &Filter::all()).unwrap(), before_rows);
}

#[test]
fn test_failed_restore_is_reported_as_rollback_failure() {
    let conn = Arc::new(Counting::new());
    let v1 = Scripted::new("1.0", vec![regions_table(&[])], Behavior::Normal);
    v1.migrate(&conn.inner).unwrap();
    conn.inner.insert("regions", region_row("r1", "Sandbox")).unwrap();

    let v2 = Scripted::new("2.0", vec![regions_table(&["sizeX"])], Behavior::Normal);
    let v3 = Scripted::new("3.0", vec![regions_table(&["sizeX", "sizeY"])], Behavior::Nothing);
    let migrators: Vec<Arc<dyn Migrator>> = vec![Arc::new(v1), Arc::new(v2), Arc::new(v3)];

    conn.fail_renames.store(true, Ordering::SeqCst);
    let mut m = manager(conn.clone(), migrators);
    let err = m.migrate().unwrap_err();

    assert!(!err.is_consistent());
    match &err {
        MigrationError::RollbackFailed { module, version, reason } => {
            assert_eq!(module, MODULE);
            assert_eq!(*version, v("3.0"));
            assert!(reason.contains("sizeY"));
            assert!(reason.contains("device offline"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(conn.inner.lock_holder(MODULE).unwrap(), None);
}

#[test]
fn test_storage_failure_names_module_and_version() {
    let conn = Arc::new(Counting::new());
    let migrators = standard_migrators();
    migrators[0].create_defaults(&conn.inner).unwrap();

    conn.fail_copies.store(true, Ordering::SeqCst);
    let mut m = manager(conn.clone(), migrators);
    let err = m.migrate().unwrap_err();

    match &err {
        MigrationError::ModuleStorage { module, version, .. } => {
            assert_eq!(module, MODULE);
            assert_eq!(*version, v("1.0"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().starts_with("module Regions version 1.0: storage error:"));
    assert_eq!(conn.inner.module_version(MODULE).unwrap(), Some(v("1.0")));
    assert!(conn.inner.list_tables().unwrap().iter().all(|t| !t.ends_with("_restore")));
}

#[test]
fn test_empty_suffix_is_rejected_before_touching_storage() {
    let conn = Arc::new(Counting::new());
    for config in [
        test_config().with_restore_suffix(""),
        test_config().with_broken_suffix(""),
    ] {
        let result = MigrationManager::with_migrators(MODULE, conn.clone(), standard_migrators(), config);
        assert!(matches!(result, Err(MigrationError::Configuration { .. })));
    }
    assert_eq!(conn.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_lock_held_by_another_owner_times_out() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    assert!(conn.try_lock_module(MODULE, "other-host").unwrap());

    let mut m = manager(conn.clone(), standard_migrators());
    let err = m.migrate().unwrap_err();
    match err {
        MigrationError::LockTimeout { module, holder, .. } => {
            assert_eq!(module, MODULE);
            assert_eq!(holder.as_deref(), Some("other-host"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(conn.module_version(MODULE).unwrap(), None);
    assert!(conn.list_tables().unwrap().is_empty());

    // Once the stale lock is released the migration goes through.
    assert!(conn.force_unlock_module(MODULE).unwrap());
    assert_eq!(m.migrate().unwrap().to_version, Some(v("1.2")));
}

#[test]
fn test_cancellation_mid_walk_rolls_back() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    let migrators = standard_migrators();
    migrators[0].create_defaults(&*conn).unwrap();

    let token = CancelToken::new();
    let mut cancelling = Scripted::new("1.1", vec![regions_table(&["sizeX"])], Behavior::Normal);
    cancelling.cancel_when_finished = Some(token.clone());

    let mut m = manager(conn.clone(), vec![migrators[0].clone(), Arc::new(cancelling), migrators[2].clone()])
        .with_cancel_token(token.clone());
    let err = m.migrate().unwrap_err();
    assert!(matches!(err, MigrationError::Cancelled { .. }));
    assert_eq!(conn.module_version(MODULE).unwrap(), Some(v("1.0")));
    assert!(!conn.table_exists("regionsettings").unwrap());
    assert!(conn.list_tables().unwrap().iter().all(|t| !t.ends_with("_restore")));

    // A later run without the cancelling hook completes the upgrade.
    let mut retry = manager(conn.clone(), standard_migrators());
    assert_eq!(retry.migrate().unwrap().to_version, Some(v("1.2")));
}

#[test]
fn test_operation_timeout_cancels_before_any_step() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    let config = test_config().with_operation_timeout(Duration::ZERO);
    let mut m = MigrationManager::with_migrators(MODULE, conn.clone(), standard_migrators(), config).unwrap();

    let err = m.migrate().unwrap_err();
    assert!(matches!(err, MigrationError::Cancelled { .. }));
    assert_eq!(conn.module_version(MODULE).unwrap(), None);
    assert_eq!(conn.lock_holder(MODULE).unwrap(), None);
}

#[test]
fn test_validation_disabled_skips_restore_point() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    let migrators = standard_migrators();
    migrators[0].create_defaults(&*conn).unwrap();

    let last = Scripted::new("1.2", vec![regions_table(&["sizeX"]), settings_table()], Behavior::Normal);
    let finished = last.finished.clone();
    let config = test_config().with_validation(false);
    let mut m = MigrationManager::with_migrators(
        MODULE,
        conn.clone(),
        vec![migrators[0].clone(), migrators[1].clone(), Arc::new(last)],
        config,
    )
    .unwrap();

    let report = m.migrate().unwrap();
    assert_eq!(report.to_version, Some(v("1.2")));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(report
        .steps
        .iter()
        .all(|s| s.kind != StepKind::RestorePoint && s.kind != StepKind::Validate));
}

#[test]
fn test_create_defaults_failure_is_recovered_by_ladder() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    let mut baseline = Scripted::new("1.0", vec![regions_table(&[])], Behavior::Normal);
    baseline.fail_defaults = true;

    let mut m = manager(conn.clone(), vec![Arc::new(baseline)]);
    let report = m.migrate().unwrap();

    assert_eq!(report.operation, OperationType::CreateDefaultAndUpgradeToTarget);
    assert_eq!(report.to_version, Some(v("1.0")));
    assert!(report.warnings.iter().any(|w| w.contains("default data unavailable")));
    assert!(report.steps.iter().any(|s| s.kind == StepKind::Retry));
}

#[test]
fn test_version_change_before_lock_is_replanned() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    let mut m = manager(conn.clone(), standard_migrators());
    assert_eq!(
        m.determine_operation().unwrap().operation_type,
        OperationType::CreateDefaultAndUpgradeToTarget
    );

    // Another process finishes the migration in between.
    let mut other = manager(conn.clone(), standard_migrators());
    other.migrate().unwrap();

    let report = m.execute_operation().unwrap();
    assert_eq!(report.operation, OperationType::DoNothing);
    assert!(!report.did_work());
    assert_eq!(conn.module_version(MODULE).unwrap(), Some(v("1.2")));
}

#[test]
fn test_ahead_and_unknown_versions() {
    let conn = Arc::new(SledConnector::temporary().unwrap());
    conn.write_module_version(MODULE, &v("9.0")).unwrap();
    let mut m = manager(conn.clone(), standard_migrators());
    assert!(m.determine_operation().unwrap().is_noop());
    assert!(!m.execute_operation().unwrap().did_work());
    assert_eq!(conn.module_version(MODULE).unwrap(), Some(v("9.0")));

    conn.write_module_version(MODULE, &v("1.0.7")).unwrap();
    assert!(matches!(
        m.determine_operation(),
        Err(MigrationError::UnknownVersion { .. })
    ));
}

#[test]
fn test_registry_rejects_duplicate_versions() {
    let mut registry = MigratorRegistry::new();
    registry
        .register(SchemaMigrator::builder(MODULE, "1.0").table(regions_table(&[])).build().unwrap())
        .unwrap();
    let dup = SchemaMigrator::builder(MODULE, "1.0.0.0").table(regions_table(&["sizeX"])).build().unwrap();
    assert!(matches!(registry.register(dup), Err(MigrationError::Configuration { .. })));

    let conn: Arc<dyn DataConnector> = Arc::new(SledConnector::temporary().unwrap());
    assert!(MigrationManager::new("Missing", conn.clone(), &registry, test_config()).is_err());
    let m = MigrationManager::new(MODULE, conn, &registry, test_config()).unwrap();
    assert_eq!(m.latest_version(), &v("1.0"));
}

#[test]
fn test_migrations_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let conn = Arc::new(SledConnector::open(dir.path()).unwrap());
        manager(conn.clone(), standard_migrators()).migrate().unwrap();
        conn.flush().unwrap();
    }

    let conn = Arc::new(SledConnector::open(dir.path()).unwrap());
    let mut m = manager(conn.clone(), standard_migrators());
    assert!(m.determine_operation().unwrap().is_noop());
    assert_eq!(conn.query("regions", &Filter::all()).unwrap().len(), 1);
}
