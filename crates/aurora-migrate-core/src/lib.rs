//! Aurora migrate core - versioned schema migrations for simulator modules.
//!
//! Each module (a named group of tables) carries a persisted schema version.
//! The [`MigrationManager`] brings a module from whatever version storage
//! holds to the newest registered [`Migrator`], validating every step and
//! rolling back when an upgrade does not produce the declared schema.

pub mod connector;
pub mod error;
pub mod migration;
pub mod schema;
pub mod value;
pub mod version;

pub use connector::{ColumnRenames, DataConnector, Filter, SledConnector};
pub use error::Error;
pub use migration::{
    CancelToken, MigrationConfig, MigrationError, MigrationManager, MigrationOperationDescription,
    MigrationReport, Migrator, MigratorRegistry, ModuleState, OperationType, RestorePoint,
    SchemaMigrator,
};
pub use schema::{ColumnDefinition, ColumnType, IndexDefinition, IndexType, SchemaError, TableSchema};
pub use value::{Row, Value};
pub use version::{Version, VersionFormatError};
