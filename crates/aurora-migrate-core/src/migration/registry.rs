//! Registry of migrators, grouped by module.

use super::error::MigrationError;
use super::migrator::Migrator;
use crate::schema::is_valid_module_name;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Check a module's migrator list and sort it by ascending version.
///
/// Rejects an empty list, migrators of another module, invalid names and
/// duplicate versions.
pub fn sort_migrators(
    module: &str,
    mut migrators: Vec<Arc<dyn Migrator>>,
) -> Result<Vec<Arc<dyn Migrator>>, MigrationError> {
    if !is_valid_module_name(module) {
        return Err(MigrationError::configuration(format!(
            "invalid module name {:?}",
            module
        )));
    }
    if migrators.is_empty() {
        return Err(MigrationError::configuration(format!(
            "no migrators registered for module {}",
            module
        )));
    }
    if let Some(stray) = migrators.iter().find(|m| m.name() != module) {
        return Err(MigrationError::configuration(format!(
            "migrator {} {} registered under module {}",
            stray.name(),
            stray.version(),
            module
        )));
    }

    migrators.sort_by(|a, b| a.version().cmp(b.version()));
    if let Some(pair) = migrators.windows(2).find(|w| w[0].version() == w[1].version()) {
        return Err(MigrationError::configuration(format!(
            "module {} has two migrators for version {}",
            module,
            pair[1].version()
        )));
    }
    Ok(migrators)
}

/// Migrators known to the host, by module name.
#[derive(Default)]
pub struct MigratorRegistry {
    modules: BTreeMap<String, Vec<Arc<dyn Migrator>>>,
}

impl MigratorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migrator.
    pub fn register<M: Migrator + 'static>(&mut self, migrator: M) -> Result<(), MigrationError> {
        self.register_arc(Arc::new(migrator))
    }

    /// Register a shared migrator.
    pub fn register_arc(&mut self, migrator: Arc<dyn Migrator>) -> Result<(), MigrationError> {
        let module = migrator.name().to_string();
        if !is_valid_module_name(&module) {
            return Err(MigrationError::configuration(format!(
                "invalid module name {:?}",
                module
            )));
        }
        for table in migrator.tables() {
            table.validate().map_err(|e| {
                MigrationError::configuration(format!(
                    "{} {}: {}",
                    module,
                    migrator.version(),
                    e
                ))
            })?;
        }

        let entry = self.modules.entry(module).or_default();
        if entry.iter().any(|m| m.version() == migrator.version()) {
            return Err(MigrationError::configuration(format!(
                "module {} has two migrators for version {}",
                migrator.name(),
                migrator.version()
            )));
        }
        let at = entry.partition_point(|m| m.version() < migrator.version());
        entry.insert(at, migrator);
        Ok(())
    }

    /// Register several migrators, stopping at the first error.
    pub fn register_all<I, M>(&mut self, migrators: I) -> Result<(), MigrationError>
    where
        I: IntoIterator<Item = M>,
        M: Migrator + 'static,
    {
        for migrator in migrators {
            self.register(migrator)?;
        }
        Ok(())
    }

    /// Module names, sorted.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Whether any migrator is registered for `module`.
    pub fn contains(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    /// Migrators of `module`, ascending by version.
    pub fn migrators_for(&self, module: &str) -> Result<Vec<Arc<dyn Migrator>>, MigrationError> {
        let migrators = self.modules.get(module).cloned().unwrap_or_default();
        sort_migrators(module, migrators)
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
