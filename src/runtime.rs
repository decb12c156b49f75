//! Runtime facade: owns the registry, the method binder, the spec store and
//! the connection source, and keeps them consistent across model and method
//! changes.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionSource, SqlConnection};
use crate::core::{DbError, Result, Row, Value};
use crate::methods::{
    AuditSink, BindingState, Caller, DEFAULT_ALLOWED_FUNCTION_PREFIXES, FunctionRegistry,
    MethodArgs, MethodBinder, MethodLogic, MethodSpec, RefreshReport, RoleLookup, RowGrants,
    default_sensitive_keys,
};
use crate::records::{self, Values};
use crate::registry::{DEFAULT_TABLE_PREFIX, ModelRegistry, ModelSpec, RuntimeModel};
use crate::schema::{
    CompatibilityPolicy, FieldDiff, FieldKind, FieldSpec, SafetyVerdict, SchemaSynchronizer,
    StatementOutcome, StatementResult, SyncReport, TableOptions, TableStatus, diff,
};
use crate::store::SpecStore;
use crate::transaction::{TransactionPolicy, TransactionRunner};

/// What happens when a model update fails the safety check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Refuse with `UnsafeMigration`.
    #[default]
    Strict,
    /// Log a warning and apply.
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub table_prefix: String,
    pub allowed_function_prefixes: Vec<String>,
    pub transaction_policy: TransactionPolicy,
    pub migration_mode: MigrationMode,
    pub sensitive_audit_keys: Vec<String>,
    pub drop_table_on_delete: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            allowed_function_prefixes: DEFAULT_ALLOWED_FUNCTION_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            transaction_policy: TransactionPolicy::default(),
            migration_mode: MigrationMode::default(),
            sensitive_audit_keys: default_sensitive_keys(),
            drop_table_on_delete: false,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn allowed_function_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.allowed_function_prefixes.push(prefix.into());
        self
    }

    pub fn transaction_policy(mut self, policy: TransactionPolicy) -> Self {
        self.transaction_policy = policy;
        self
    }

    pub fn migration_mode(mut self, mode: MigrationMode) -> Self {
        self.migration_mode = mode;
        self
    }

    pub fn sensitive_audit_key(mut self, key: impl Into<String>) -> Self {
        self.sensitive_audit_keys.push(key.into());
        self
    }

    pub fn drop_table_on_delete(mut self, drop: bool) -> Self {
        self.drop_table_on_delete = drop;
        self
    }

    /// Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}

/// Outcome of [`ModelRuntime::update_model`].
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub model: String,
    pub diff: FieldDiff,
    pub verdict: SafetyVerdict,
    pub schema: Vec<SyncReport>,
    /// Methods bound again on the new handle.
    pub rebound: Vec<String>,
}

impl MigrationReport {
    /// DDL statements that were skipped (warn mode only).
    pub fn skipped_statements(&self) -> Vec<&str> {
        self.schema
            .iter()
            .flat_map(|report| report.failures())
            .map(|statement| statement.sql.as_str())
            .collect()
    }
}

/// Optional consistency rule for [`ModelRuntime::create_master_with_details`]:
/// the master's amount must equal the sum of price times quantity over the
/// details, within 0.01.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountCheck {
    pub amount_field: String,
    pub price_field: String,
    pub quantity_field: String,
}

impl AmountCheck {
    pub const TOLERANCE: f64 = 0.01;

    pub fn new(
        amount_field: impl Into<String>,
        price_field: impl Into<String>,
        quantity_field: impl Into<String>,
    ) -> Self {
        Self {
            amount_field: amount_field.into(),
            price_field: price_field.into(),
            quantity_field: quantity_field.into(),
        }
    }

    fn verify(&self, master: &Values, details: &[Values]) -> Result<()> {
        let number = |values: &Values, key: &str| -> Result<f64> {
            values.get(key).and_then(Value::as_f64).ok_or_else(|| {
                DbError::Validation(format!("Numeric value for '{}' is required", key))
            })
        };
        let amount = number(master, &self.amount_field)?;
        let mut total = 0.0;
        for detail in details {
            total += number(detail, &self.price_field)? * number(detail, &self.quantity_field)?;
        }
        if (amount - total).abs() > Self::TOLERANCE {
            return Err(DbError::Validation(format!(
                "Amount {} does not match detail total {:.2}",
                amount, total
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterDetailIds {
    pub master_id: i64,
    pub detail_ids: Vec<i64>,
}

/// Dynamic model runtime.
///
/// Lifecycle: [`open`](Self::open), [`warm_up`](Self::warm_up) to load
/// declarations from the store and bind their methods, then
/// [`shutdown`](Self::shutdown) to drop every handle and binding.
pub struct ModelRuntime {
    config: RuntimeConfig,
    source: Arc<dyn ConnectionSource>,
    store: Arc<dyn SpecStore>,
    registry: Arc<ModelRegistry>,
    functions: Arc<FunctionRegistry>,
    binder: MethodBinder,
    synchronizer: SchemaSynchronizer,
    compatibility: CompatibilityPolicy,
    runner: TransactionRunner,
}

impl ModelRuntime {
    pub fn open(
        source: Arc<dyn ConnectionSource>,
        store: Arc<dyn SpecStore>,
        config: RuntimeConfig,
    ) -> Self {
        let registry = Arc::new(
            ModelRegistry::new(Arc::clone(&source))
                .with_store(Arc::clone(&store))
                .with_table_prefix(config.table_prefix.clone()),
        );
        let functions = Arc::new(FunctionRegistry::new(
            config.allowed_function_prefixes.iter().cloned(),
        ));
        let binder = MethodBinder::new(Arc::clone(&registry))
            .with_functions(Arc::clone(&functions))
            .with_sensitive_keys(config.sensitive_audit_keys.clone())
            .with_transaction_policy(config.transaction_policy.clone())
            .with_store(Arc::clone(&store));

        debug!(dialect = ?source.dialect(), "model runtime opened");
        Self {
            runner: TransactionRunner::new(config.transaction_policy.clone()),
            config,
            source,
            store,
            registry,
            functions,
            binder,
            synchronizer: SchemaSynchronizer::new(),
            compatibility: CompatibilityPolicy::default(),
        }
    }

    pub fn with_roles(mut self, roles: Arc<dyn RoleLookup>) -> Self {
        self.binder = self.binder.with_roles(roles);
        self
    }

    pub fn with_row_grants(mut self, grants: Arc<dyn RowGrants>) -> Self {
        self.binder = self.binder.with_row_grants(grants);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.binder = self.binder.with_audit_sink(sink);
        self
    }

    pub fn with_compatibility(mut self, policy: CompatibilityPolicy) -> Self {
        self.compatibility = policy;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn binder(&self) -> &MethodBinder {
        &self.binder
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    pub fn store(&self) -> &Arc<dyn SpecStore> {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn ConnectionSource> {
        &self.source
    }

    /// Loads active models and binds their active methods.
    pub fn warm_up(&self) -> Result<RefreshReport> {
        self.registry.ensure_loaded()?;
        let report = self.binder.refresh()?;
        info!(
            models = self.registry.len(),
            methods = report.bound.len(),
            "model runtime warmed up"
        );
        Ok(report)
    }

    pub fn shutdown(&self) {
        let unbound = self.binder.unbind_all();
        self.registry.reset();
        info!(unbound, "model runtime shut down");
    }

    /// Registers a new model and persists its declaration with the table it
    /// ended up on. An inactive spec is only persisted.
    pub fn create_model(&self, spec: &ModelSpec) -> Result<Option<Arc<RuntimeModel>>> {
        spec.validate()?;
        if self.registry.contains(&spec.name) || self.store.model(&spec.name)?.is_some() {
            return Err(DbError::Validation(format!(
                "Model '{}' already exists",
                spec.name
            )));
        }
        if !spec.active {
            self.store.save_model(spec)?;
            return Ok(None);
        }

        let handle = self.registry.register(spec)?;
        let mut persisted = spec.clone();
        persisted.table_name = Some(handle.table_name().to_string());
        if let Err(err) = self.store.save_model(&persisted) {
            self.registry.unregister(&spec.name);
            return Err(err);
        }
        Ok(Some(handle))
    }

    /// Moves a registered model to `spec`.
    ///
    /// The field diff is checked against the compatibility policy first; in
    /// strict mode an unsafe change is refused before anything is touched.
    /// Column changes run in one transaction, then the handle is rebuilt and
    /// the model's methods are bound again on it.
    pub fn update_model(&self, spec: &ModelSpec) -> Result<MigrationReport> {
        spec.validate()?;
        let current = self.registry.require(&spec.name)?;
        if let Some(table) = &spec.table_name {
            if table != current.table_name() {
                return Err(DbError::UnsupportedOperation(format!(
                    "renaming table '{}' to '{}'",
                    current.table_name(),
                    table
                )));
            }
        }

        let old_fields: Vec<FieldSpec> = current.user_fields().cloned().collect();
        let changes = diff(&old_fields, &spec.fields);
        let verdict = self.compatibility.validate(&old_fields, &spec.fields);
        if let SafetyVerdict::Unsafe { reason, .. } = &verdict {
            match self.config.migration_mode {
                MigrationMode::Strict => {
                    return Err(DbError::UnsafeMigration {
                        model: spec.name.clone(),
                        reason: reason.clone(),
                    });
                }
                MigrationMode::Warn => {
                    warn!(model = %spec.name, reason = %reason, "applying unsafe migration");
                }
            }
        }

        let mut conn = self.source.acquire()?;
        let schema = self.runner.run(conn.as_mut(), |tx| {
            self.apply_changes(tx, &current, &changes)
        })?;
        drop(conn);

        let mut next = spec.clone();
        next.table_name = Some(current.table_name().to_string());
        self.registry.rebuild(&next)?;
        self.store.save_model(&next)?;

        let mut rebound = Vec::new();
        for method in self.binder.bound_methods(&spec.name) {
            let Some(method_spec) = self.binder.bound_spec(&spec.name, &method) else {
                continue;
            };
            match self.binder.bind(&method_spec, true) {
                Ok(_) => rebound.push(method),
                Err(err) => {
                    warn!(model = %spec.name, method = %method, error = %err, "method no longer binds after update");
                    self.binder.unbind(&spec.name, &method);
                }
            }
        }

        info!(
            model = %spec.name,
            added = changes.added.len(),
            dropped = changes.dropped.len(),
            modified = changes.modified.len(),
            "model updated"
        );
        Ok(MigrationReport {
            model: spec.name.clone(),
            diff: changes,
            verdict,
            schema,
            rebound,
        })
    }

    fn apply_changes(
        &self,
        conn: &mut dyn SqlConnection,
        current: &RuntimeModel,
        changes: &FieldDiff,
    ) -> Result<Vec<SyncReport>> {
        let table = current.table_name();
        let mut reports = Vec::new();

        for field in &changes.added {
            let foreign_table = match &field.kind {
                FieldKind::ForeignKey { to, .. } if to == current.name() => Some(table.to_string()),
                FieldKind::ForeignKey { to, .. } => {
                    Some(self.registry.require(to)?.table_name().to_string())
                }
                _ => None,
            };
            reports.push(self.synchronizer.add_column(
                conn,
                table,
                field,
                foreign_table.as_deref(),
            )?);
        }

        for change in &changes.modified {
            let result = self
                .synchronizer
                .alter_column(conn, table, &change.old, &change.new);
            let report = self.tolerate_unsupported(table, &change.new.name, result)?;
            // label and help text live only in the declaration
            if !report.statements.is_empty() {
                reports.push(report);
            }
        }

        for field in &changes.dropped {
            let result = self.synchronizer.drop_column(conn, table, &field.column_name());
            reports.push(self.tolerate_unsupported(table, &field.name, result)?);
        }

        Ok(reports)
    }

    /// In warn mode a column change the engine cannot express is recorded
    /// and skipped; the column keeps its old definition.
    fn tolerate_unsupported(
        &self,
        table: &str,
        column: &str,
        result: Result<SyncReport>,
    ) -> Result<SyncReport> {
        match result {
            Err(DbError::UnsupportedOperation(what)) if self.config.migration_mode == MigrationMode::Warn => {
                warn!(table, column, operation = %what, "column change not supported, skipped");
                Ok(SyncReport {
                    table: table.to_string(),
                    status: TableStatus::Altered,
                    statements: vec![StatementResult {
                        sql: what.clone(),
                        outcome: StatementOutcome::Failed(format!("Unsupported operation: {}", what)),
                    }],
                })
            }
            other => other,
        }
    }

    /// Unregisters the model and unbinds its methods; the table and the
    /// declaration are kept. Returns whether the model was registered.
    pub fn deactivate_model(&self, name: &str) -> Result<bool> {
        let mut spec = self
            .store
            .model(name)?
            .ok_or_else(|| DbError::ModelNotFound(name.to_string()))?;
        spec.active = false;
        self.store.save_model(&spec)?;
        self.binder.unbind_model(name);
        Ok(self.registry.unregister(name))
    }

    /// Registers a stored model again and binds its active methods.
    pub fn activate_model(&self, name: &str) -> Result<Arc<RuntimeModel>> {
        let mut spec = self
            .store
            .model(name)?
            .ok_or_else(|| DbError::ModelNotFound(name.to_string()))?;
        spec.active = true;
        let handle = self.registry.register(&spec)?;
        self.store.save_model(&spec)?;

        for method in self.store.methods_of(name)?.iter().filter(|m| m.active) {
            if let Err(err) = self.binder.bind(method, false) {
                warn!(model = name, method = %method.method_name, error = %err, "skipping method that failed to bind");
            }
        }
        Ok(handle)
    }

    /// Removes a model, its methods and its declaration. The table is dropped
    /// when `drop_table` (or, if `None`, the configured default) says so.
    ///
    /// Refused while another registered model holds a foreign key to it.
    pub fn delete_model(&self, name: &str, drop_table: Option<bool>) -> Result<bool> {
        if let Some(dependent) = self
            .registry
            .get_all()
            .values()
            .find(|m| m.name() != name && m.foreign_keys().any(|(_, target)| target == name))
        {
            return Err(DbError::Validation(format!(
                "Model '{}' is referenced by '{}'",
                name,
                dependent.name()
            )));
        }

        let table = match self.registry.lookup(name) {
            Some(handle) => Some(handle.table_name().to_string()),
            None => self.store.model(name)?.and_then(|spec| spec.table_name),
        };

        let unbound = self.binder.unbind_model(name);
        let registered = self.registry.unregister(name);
        let stored = self.store.remove_model(name)?;

        if drop_table.unwrap_or(self.config.drop_table_on_delete) {
            if let Some(table) = table {
                let mut conn = self.source.acquire()?;
                self.synchronizer.drop_table_if_present(conn.as_mut(), &table)?;
            }
        }

        info!(model = name, unbound, "model deleted");
        Ok(registered || stored)
    }

    /// Persists a method and binds it, replacing an earlier definition.
    pub fn define_method(&self, spec: &MethodSpec) -> Result<BindingState> {
        let logic = spec.validate()?;
        if let MethodLogic::CustomFunc { path } = &logic {
            self.functions.check_path(path)?;
        }
        self.registry.require(&spec.model_name)?;
        self.store.save_method(spec)?;

        if spec.active {
            self.binder.bind(spec, true)?;
        } else {
            self.binder.unbind(&spec.model_name, &spec.method_name);
        }
        Ok(self.binder.state(&spec.model_name, &spec.method_name))
    }

    pub fn remove_method(&self, model: &str, method: &str) -> Result<bool> {
        let unbound = self.binder.unbind(model, method);
        let stored = self.store.remove_method(model, method)?;
        Ok(unbound || stored)
    }

    pub fn refresh_methods(&self) -> Result<RefreshReport> {
        self.binder.refresh()
    }

    pub fn invoke(
        &self,
        model: &str,
        instance_id: i64,
        method: &str,
        caller: &Caller,
        args: &MethodArgs,
    ) -> Result<Value> {
        let mut conn = self.source.acquire()?;
        self.binder
            .invoke(conn.as_mut(), model, instance_id, method, caller, args)
    }

    pub fn insert(&self, model: &str, values: &Values) -> Result<i64> {
        let handle = self.registry.require(model)?;
        self.transaction(|tx| records::insert(tx, &handle, values))
    }

    pub fn fetch(&self, model: &str, id: i64) -> Result<Row> {
        let handle = self.registry.require(model)?;
        let mut conn = self.source.acquire()?;
        records::fetch(conn.as_mut(), &handle, id)
    }

    /// Runs `unit` in a retried transaction on a fresh connection.
    pub fn transaction<T, F>(&self, unit: F) -> Result<T>
    where
        F: FnMut(&mut dyn SqlConnection) -> Result<T>,
    {
        let mut conn = self.source.acquire()?;
        self.runner.run(conn.as_mut(), unit)
    }

    /// Creates a table whose columns are inferred from sample rows.
    pub fn ensure_table_from_sample(
        &self,
        table: &str,
        sample: &[serde_json::Value],
        options: &TableOptions,
    ) -> Result<SyncReport> {
        let mut conn = self.source.acquire()?;
        self.synchronizer
            .ensure_table_from_sample(conn.as_mut(), table, sample, options)
    }

    /// Inserts a master row and its detail rows atomically.
    ///
    /// The detail model must hold a foreign key to the master model; each
    /// detail row gets it set to the new master id. With an [`AmountCheck`]
    /// nothing is written unless the amounts agree.
    pub fn create_master_with_details(
        &self,
        master_model: &str,
        master: &Values,
        detail_model: &str,
        details: &[Values],
        check: Option<&AmountCheck>,
    ) -> Result<MasterDetailIds> {
        let master_handle = self.registry.require(master_model)?;
        let detail_handle = self.registry.require(detail_model)?;
        let fk_name = detail_handle
            .foreign_keys()
            .find(|(_, target)| *target == master_model)
            .map(|(fk, _)| fk.name.clone())
            .ok_or_else(|| {
                DbError::Validation(format!(
                    "Model '{}' has no foreign key to '{}'",
                    detail_model, master_model
                ))
            })?;
        if let Some(check) = check {
            check.verify(master, details)?;
        }

        let ids = self.transaction(|tx| {
            let master_id = records::insert(tx, &master_handle, master)?;
            let mut detail_ids = Vec::with_capacity(details.len());
            for detail in details {
                let mut row = detail.clone();
                row.remove(&format!("{}_id", fk_name));
                row.insert(fk_name.clone(), Value::Integer(master_id));
                detail_ids.push(records::insert(tx, &detail_handle, &row)?);
            }
            Ok(MasterDetailIds {
                master_id,
                detail_ids,
            })
        })?;

        info!(
            master = master_model,
            master_id = ids.master_id,
            details = ids.detail_ids.len(),
            "master-detail rows created"
        );
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionPool};
    use crate::store::MemorySpecStore;

    fn runtime(config: RuntimeConfig) -> ModelRuntime {
        let pool = Arc::new(ConnectionPool::new(ConnectionConfig::in_memory()).unwrap());
        ModelRuntime::open(pool, Arc::new(MemorySpecStore::new()), config)
    }

    #[test]
    fn test_config_defaults_and_partial_json() {
        let config = RuntimeConfig::from_json_str(r#"{"migration_mode": "warn"}"#).unwrap();
        assert_eq!(config.migration_mode, MigrationMode::Warn);
        assert_eq!(config.table_prefix, "lowcode_");
        assert!(!config.drop_table_on_delete);
        assert_eq!(config.transaction_policy, TransactionPolicy::default());
    }

    #[test]
    fn test_create_model_persists_resolved_table() {
        let rt = runtime(RuntimeConfig::default());
        let spec = ModelSpec::new("Customer").field(FieldSpec::new("name", FieldKind::char(80)));
        let handle = rt.create_model(&spec).unwrap().unwrap();

        let stored = rt.store().model("Customer").unwrap().unwrap();
        assert_eq!(stored.table_name.as_deref(), Some(handle.table_name()));
        assert!(matches!(rt.create_model(&spec), Err(DbError::Validation(_))));
    }

    #[test]
    fn test_strict_mode_refuses_narrowing() {
        let rt = runtime(RuntimeConfig::default());
        rt.create_model(&ModelSpec::new("Meter").field(FieldSpec::new("reading", FieldKind::BigInteger)))
            .unwrap();

        let narrowed = ModelSpec::new("Meter").field(FieldSpec::new("reading", FieldKind::SmallInteger));
        let err = rt.update_model(&narrowed).unwrap_err();
        assert!(matches!(err, DbError::UnsafeMigration { .. }));
        assert_eq!(
            rt.registry().require("Meter").unwrap().field("reading").unwrap().kind,
            FieldKind::BigInteger
        );
    }

    #[test]
    fn test_amount_check() {
        let check = AmountCheck::new("amount", "price", "qty");
        let master: Values = [("amount".to_string(), Value::Float(25.0))].into();
        let line = |price: f64, qty: i64| -> Values {
            [
                ("price".to_string(), Value::Float(price)),
                ("qty".to_string(), Value::Integer(qty)),
            ]
            .into()
        };
        assert!(check.verify(&master, &[line(10.0, 2), line(5.0, 1)]).is_ok());
        assert!(check.verify(&master, &[line(10.0, 2)]).is_err());
        assert!(check.verify(&master, &[line(12.496, 2)]).is_ok());
    }
}
