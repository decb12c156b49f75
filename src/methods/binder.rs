use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use super::audit::{AuditEntry, AuditOutcome, AuditSink, TracingAuditSink, default_sensitive_keys, sanitize};
use super::context::{Caller, MethodArgs, MethodContext};
use super::functions::FunctionRegistry;
use super::permission::{AllowAllRows, RoleLookup, RowGrants, StaticPermissions, check_roles, check_row};
use super::spec::{MethodLogic, MethodSpec};
use super::templates;
use crate::connection::SqlConnection;
use crate::core::{DbError, Result, Value};
use crate::registry::ModelRegistry;
use crate::store::SpecStore;
use crate::transaction::{TransactionPolicy, TransactionRunner};

/// Internal implementation of a bound method.
pub type MethodHandler =
    Arc<dyn Fn(&mut MethodContext<'_>, &MethodArgs) -> Result<Value> + Send + Sync>;

/// Lifecycle of one `(model, method)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    Bound,
    /// Bound again with force after a configuration change.
    Rebound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    AlreadyBound,
    Rebound,
}

struct Binding {
    spec: MethodSpec,
    handler: MethodHandler,
    state: BindingState,
    bound_at: DateTime<Utc>,
}

/// Result of [`MethodBinder::refresh`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub unbound: usize,
    pub bound: Vec<(String, String)>,
    pub skipped: Vec<(String, String, String)>,
}

/// Binding table of permission-gated, audited methods.
///
/// The table has its own lock, separate from the model registry's, and it is
/// never held while a method body runs.
pub struct MethodBinder {
    registry: Arc<ModelRegistry>,
    functions: Arc<FunctionRegistry>,
    roles: Arc<dyn RoleLookup>,
    grants: Arc<dyn RowGrants>,
    audit: Arc<dyn AuditSink>,
    sensitive_keys: Vec<String>,
    runner: TransactionRunner,
    store: Option<Arc<dyn SpecStore>>,
    bindings: Mutex<HashMap<(String, String), Binding>>,
}

impl MethodBinder {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            functions: Arc::new(FunctionRegistry::default()),
            roles: Arc::new(StaticPermissions::new()),
            grants: Arc::new(AllowAllRows),
            audit: Arc::new(TracingAuditSink),
            sensitive_keys: default_sensitive_keys(),
            runner: TransactionRunner::default(),
            store: None,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_roles(mut self, roles: Arc<dyn RoleLookup>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_row_grants(mut self, grants: Arc<dyn RowGrants>) -> Self {
        self.grants = grants;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_sensitive_keys(mut self, keys: Vec<String>) -> Self {
        self.sensitive_keys = keys;
        self
    }

    pub fn with_transaction_policy(mut self, policy: TransactionPolicy) -> Self {
        self.runner = TransactionRunner::new(policy);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SpecStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Attaches `spec` to its model.
    ///
    /// Without `force` an existing binding is left untouched; with `force`
    /// it is replaced. A spec that fails validation changes nothing.
    pub fn bind(&self, spec: &MethodSpec, force: bool) -> Result<BindOutcome> {
        let handler = self.prepare(spec)?;

        let key = spec.key();
        let mut bindings = self.bindings.lock();
        let state = match bindings.get(&key) {
            Some(_) if !force => {
                debug!(model = %key.0, method = %key.1, "method already bound");
                return Ok(BindOutcome::AlreadyBound);
            }
            Some(_) => BindingState::Rebound,
            None => BindingState::Bound,
        };

        bindings.insert(
            key.clone(),
            Binding {
                spec: spec.clone(),
                handler,
                state,
                bound_at: Utc::now(),
            },
        );
        info!(model = %key.0, method = %key.1, logic = %spec.logic_type, ?state, "method bound");

        Ok(match state {
            BindingState::Rebound => BindOutcome::Rebound,
            _ => BindOutcome::Bound,
        })
    }

    /// Validates `spec` against the allow-list and the registry and builds
    /// its handler. Touches no binding.
    fn prepare(&self, spec: &MethodSpec) -> Result<MethodHandler> {
        let logic = spec.validate()?;
        if let MethodLogic::CustomFunc { path } = &logic {
            self.functions.check_path(path)?;
        }
        self.registry.require(&spec.model_name)?;
        Ok(self.build_handler(logic))
    }

    fn build_handler(&self, logic: MethodLogic) -> MethodHandler {
        let functions = Arc::clone(&self.functions);
        Arc::new(move |ctx: &mut MethodContext<'_>, args: &MethodArgs| {
            templates::execute(&logic, ctx, args, &functions)
        })
    }

    pub fn unbind(&self, model: &str, method: &str) -> bool {
        let removed = self
            .bindings
            .lock()
            .remove(&(model.to_string(), method.to_string()))
            .is_some();
        if removed {
            info!(model, method, "method unbound");
        }
        removed
    }

    /// Unbinds every method of `model`; returns how many were bound.
    pub fn unbind_model(&self, model: &str) -> usize {
        let mut bindings = self.bindings.lock();
        let before = bindings.len();
        bindings.retain(|(owner, _), _| owner != model);
        before - bindings.len()
    }

    pub fn unbind_all(&self) -> usize {
        let mut bindings = self.bindings.lock();
        let count = bindings.len();
        bindings.clear();
        count
    }

    pub fn state(&self, model: &str, method: &str) -> BindingState {
        self.bindings
            .lock()
            .get(&(model.to_string(), method.to_string()))
            .map(|b| b.state)
            .unwrap_or(BindingState::Unbound)
    }

    pub fn is_bound(&self, model: &str, method: &str) -> bool {
        self.state(model, method) != BindingState::Unbound
    }

    /// Current handler, for identity checks.
    pub fn handler(&self, model: &str, method: &str) -> Option<MethodHandler> {
        self.bindings
            .lock()
            .get(&(model.to_string(), method.to_string()))
            .map(|b| Arc::clone(&b.handler))
    }

    pub fn bound_spec(&self, model: &str, method: &str) -> Option<MethodSpec> {
        self.bindings
            .lock()
            .get(&(model.to_string(), method.to_string()))
            .map(|b| b.spec.clone())
    }

    pub fn bound_at(&self, model: &str, method: &str) -> Option<DateTime<Utc>> {
        self.bindings
            .lock()
            .get(&(model.to_string(), method.to_string()))
            .map(|b| b.bound_at)
    }

    /// Sorted method names bound on `model`.
    pub fn bound_methods(&self, model: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .bindings
            .lock()
            .keys()
            .filter(|(owner, _)| owner == model)
            .map(|(_, method)| method.clone())
            .collect();
        names.sort();
        names
    }

    /// Replaces the binding table with every active method whose model is
    /// registered, from the spec store. Bad specs are skipped and reported.
    ///
    /// The new table is built aside and swapped in under one lock, so a
    /// concurrent call sees either the old bindings or the new ones.
    pub fn refresh(&self) -> Result<RefreshReport> {
        let store = self.store.as_ref().ok_or_else(|| {
            DbError::UnsupportedOperation("method refresh requires a spec store".into())
        })?;
        let specs = store.load_methods()?;

        let mut report = RefreshReport::default();
        let mut next = HashMap::new();
        for spec in specs.iter().filter(|s| s.active) {
            if self.registry.lookup(&spec.model_name).is_none() {
                debug!(model = %spec.model_name, method = %spec.method_name, "model not active, method left unbound");
                continue;
            }
            match self.prepare(spec) {
                Ok(handler) => {
                    report.bound.push(spec.key());
                    next.insert(
                        spec.key(),
                        Binding {
                            spec: spec.clone(),
                            handler,
                            state: BindingState::Bound,
                            bound_at: Utc::now(),
                        },
                    );
                }
                Err(err) => {
                    warn!(model = %spec.model_name, method = %spec.method_name, error = %err, "skipping method that failed to bind");
                    report
                        .skipped
                        .push((spec.model_name.clone(), spec.method_name.clone(), err.to_string()));
                }
            }
        }

        report.unbound = std::mem::replace(&mut *self.bindings.lock(), next).len();
        info!(bound = report.bound.len(), skipped = report.skipped.len(), "methods refreshed");
        Ok(report)
    }

    /// Public dispatch: role check, row check, body, audit.
    ///
    /// The body runs inside the retrying transaction (joining the caller's if
    /// one is open). Every call is audited once, whatever its outcome, and an
    /// audit failure never replaces the call's own result.
    pub fn invoke(
        &self,
        conn: &mut dyn SqlConnection,
        model: &str,
        instance_id: i64,
        method: &str,
        caller: &Caller,
        args: &MethodArgs,
    ) -> Result<Value> {
        let span = info_span!("method.invoke", model, method, instance_id);
        let _entered = span.enter();
        let started = Instant::now();

        // Lazy loading creates tables on another connection; never inside the transaction.
        let outcome = self.registry.ensure_loaded().and_then(|_| {
            self.runner
                .run(conn, |tx| self.dispatch(tx, model, instance_id, method, caller, args))
        });

        self.record_audit(model, instance_id, method, caller, args, &outcome, started);
        outcome
    }

    fn dispatch(
        &self,
        conn: &mut dyn SqlConnection,
        model: &str,
        instance_id: i64,
        method: &str,
        caller: &Caller,
        args: &MethodArgs,
    ) -> Result<Value> {
        let (allowed_roles, handler) = {
            let bindings = self.bindings.lock();
            let binding = bindings
                .get(&(model.to_string(), method.to_string()))
                .ok_or_else(|| DbError::MethodNotBound {
                    model: model.to_string(),
                    method: method.to_string(),
                })?;
            (binding.spec.allowed_roles.clone(), Arc::clone(&binding.handler))
        };
        let handle = self.registry.require(model)?;

        let target = format!("{}.{}", model, method);
        check_roles(caller, &allowed_roles, self.roles.as_ref(), &target).into_result()?;
        check_roles(caller, &self.registry.model_roles(model), self.roles.as_ref(), model)
            .into_result()?;
        check_row(caller, self.grants.as_ref(), model, instance_id).into_result()?;

        let mut ctx = MethodContext {
            conn,
            registry: self.registry.as_ref(),
            model: handle,
            instance_id,
            caller,
        };
        handler(&mut ctx, args)
    }

    fn record_audit(
        &self,
        model: &str,
        instance_id: i64,
        method: &str,
        caller: &Caller,
        args: &MethodArgs,
        outcome: &Result<Value>,
        started: Instant,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            caller: caller.to_string(),
            model: model.to_string(),
            method: method.to_string(),
            instance_id,
            args: sanitize(&args.to_json(), &self.sensitive_keys),
            outcome: match outcome {
                Ok(value) => AuditOutcome::Success {
                    result: value.to_json(),
                },
                Err(err) => AuditOutcome::Failure {
                    error: err.to_string(),
                },
            },
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        match panic::catch_unwind(AssertUnwindSafe(|| self.audit.record(&entry))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(model, method, error = %err, "audit sink failed; call outcome unaffected");
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(model, method, panic = %reason, "audit sink panicked; call outcome unaffected");
            }
        }
    }
}
