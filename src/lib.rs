// ============================================================================
// dynaschema Library
// ============================================================================

pub mod core;
pub mod connection;
pub mod schema;
pub mod registry;
pub mod methods;
pub mod transaction;
pub mod store;
pub mod records;
pub mod runtime;

// Re-export main types for convenience
pub use core::{DbError, Result, Row, Value};
pub use runtime::{AmountCheck, MasterDetailIds, MigrationMode, MigrationReport, ModelRuntime, RuntimeConfig};

// Re-export connection API
pub use connection::{
    ConnectionSource, SqlConnection,
    config::{ConnectionConfig, DatabaseLocation},
    pool::{ConnectionPool, PoolGuard, PoolStats},
    sqlite::SqliteConnection,
};

pub use schema::{Dialect, FieldKind, FieldSpec, FieldType, OnDelete, SchemaSynchronizer, TableOptions};
pub use registry::{ModelRegistry, ModelSpec, RuntimeModel};
pub use methods::{
    AggregateOp, AuditSink, Caller, FunctionRegistry, LogicType, MethodArgs, MethodBinder,
    MethodContext, MethodSpec,
};
pub use transaction::{TransactionPolicy, TransactionRunner};
pub use store::{JsonFileSpecStore, MemorySpecStore, SpecStore};

// ============================================================================
// Quick start
// ============================================================================

/// Opens a runtime over a SQLite database with an in-memory spec store.
///
/// `url` is `sqlite://path/to/file.db` or `sqlite::memory:`.
///
/// # Examples
///
/// ```
/// use dynaschema::{Caller, FieldKind, FieldSpec, MethodArgs, MethodSpec, ModelSpec};
/// use serde_json::json;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = dynaschema::open_sqlite("sqlite::memory:")?;
///
/// runtime.create_model(
///     &ModelSpec::new("Ticket").field(FieldSpec::new("status", FieldKind::char(20))),
/// )?;
/// runtime.define_method(&MethodSpec::field_update(
///     "Ticket",
///     "close",
///     json!({"field": "status"}),
/// ))?;
///
/// let id = runtime.insert("Ticket", &Default::default())?;
/// let status = runtime.invoke(
///     "Ticket",
///     id,
///     "close",
///     &Caller::user("alice"),
///     &MethodArgs::new().arg("closed"),
/// )?;
/// assert_eq!(status, dynaschema::Value::Text("closed".into()));
/// # Ok(())
/// # }
/// ```
pub fn open_sqlite(url: &str) -> Result<ModelRuntime> {
    let config = ConnectionConfig::from_url(url).map_err(DbError::Validation)?;
    let pool = std::sync::Arc::new(ConnectionPool::new(config)?);
    Ok(ModelRuntime::open(
        pool,
        std::sync::Arc::new(MemorySpecStore::new()),
        RuntimeConfig::default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_sqlite_memory() {
        let runtime = open_sqlite("sqlite::memory:").unwrap();
        assert!(runtime.registry().is_empty());
        assert_eq!(runtime.source().dialect(), Dialect::Sqlite);
    }

    #[test]
    fn test_open_sqlite_rejects_other_schemes() {
        assert!(matches!(
            open_sqlite("postgres://localhost/app"),
            Err(DbError::Validation(_))
        ));
    }
}
