use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, error, info};

use super::model::{RuntimeModel, cache_key};
use super::spec::{ModelSpec, validate_fields};
use crate::connection::ConnectionSource;
use crate::core::{DbError, Result};
use crate::schema::ddl::TableOptions;
use crate::schema::field::{FieldKind, FieldSpec};
use crate::schema::naming::{default_table_name, unique_table_name, validate_table_name};
use crate::schema::synchronizer::SchemaSynchronizer;
use crate::store::SpecStore;

pub const DEFAULT_TABLE_PREFIX: &str = "lowcode_";

type ModelMap = HashMap<String, Arc<RuntimeModel>>;

/// Name → runtime model registry.
///
/// Mutations (build, register, unregister) are serialized by one re-entrant
/// lock. The name map is copy-on-write, so readers clone an `Arc` and never
/// wait on a writer for longer than the pointer swap.
pub struct ModelRegistry {
    source: Arc<dyn ConnectionSource>,
    synchronizer: SchemaSynchronizer,
    store: Option<Arc<dyn SpecStore>>,
    table_prefix: String,

    mutation: ReentrantMutex<()>,
    models: RwLock<Arc<ModelMap>>,
    /// cache key -> handle
    cache: RwLock<ModelMap>,
    roles: RwLock<HashMap<String, BTreeSet<String>>>,

    loaded: AtomicBool,
    load_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self {
            source,
            synchronizer: SchemaSynchronizer::new(),
            store: None,
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            mutation: ReentrantMutex::new(()),
            models: RwLock::new(Arc::new(HashMap::new())),
            cache: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
            loaded: AtomicBool::new(false),
            load_lock: Mutex::new(()),
        }
    }

    /// Models in `store` are registered lazily on first read.
    pub fn with_store(mut self, store: Arc<dyn SpecStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }

    pub fn source(&self) -> &Arc<dyn ConnectionSource> {
        &self.source
    }

    /// Returns the handle for this exact declaration, building it on a cache miss.
    ///
    /// A miss validates the declaration, creates the table if absent and
    /// registers the handle under `model_name`, replacing an older handle of
    /// the same name. Nothing is registered when any step fails.
    pub fn get_or_build(
        &self,
        model_name: &str,
        table_name: &str,
        fields: &[FieldSpec],
    ) -> Result<Arc<RuntimeModel>> {
        validate_fields(model_name, fields)?;
        validate_table_name(table_name)?;
        let key = cache_key(model_name, table_name, fields);

        let _guard = self.mutation.lock();
        let cached = self.cache.read().get(&key).cloned();
        if let Some(handle) = cached {
            self.ensure_named(&handle);
            return Ok(handle);
        }

        let current = self.models.read().clone();
        if let Some(owner) = current
            .values()
            .find(|m| m.table_name() == table_name && m.name() != model_name)
        {
            return Err(DbError::Validation(format!(
                "Table '{}' already belongs to model '{}'",
                table_name,
                owner.name()
            )));
        }

        let options = self.table_options(model_name, table_name, fields, &current)?;
        let handle = Arc::new(RuntimeModel::build(model_name, table_name, fields, key.clone()));

        {
            let mut conn = self.source.acquire()?;
            self.synchronizer
                .create_table_if_absent(conn.as_mut(), table_name, handle.fields(), &options)?;
        }

        {
            let mut cache = self.cache.write();
            if let Some(previous) = current.get(model_name) {
                cache.remove(previous.cache_key());
            }
            cache.insert(key, Arc::clone(&handle));
        }
        self.swap_models(|models| {
            models.insert(model_name.to_string(), Arc::clone(&handle));
        });

        info!(model = model_name, table = table_name, fields = fields.len(), "model built");
        Ok(handle)
    }

    /// Builds `spec` and records its model-level roles.
    pub fn register(&self, spec: &ModelSpec) -> Result<Arc<RuntimeModel>> {
        let _guard = self.mutation.lock();
        let table = self.resolve_table_name(spec);
        let handle = self.get_or_build(&spec.name, &table, &spec.fields)?;
        self.roles
            .write()
            .insert(spec.name.clone(), spec.allowed_roles.clone());
        Ok(handle)
    }

    /// Forces a fresh handle for `spec` even when its cache key is unchanged.
    ///
    /// The previous handle stays registered if the rebuild fails.
    pub fn rebuild(&self, spec: &ModelSpec) -> Result<Arc<RuntimeModel>> {
        let _guard = self.mutation.lock();
        let existing = self.models.read().get(&spec.name).cloned();
        if let Some(existing) = existing {
            self.cache.write().remove(existing.cache_key());
        }
        self.register(spec)
    }

    /// Table for `spec`: the explicit one, the handle's current one, or a
    /// fresh derived name that no other model uses.
    pub fn resolve_table_name(&self, spec: &ModelSpec) -> String {
        if let Some(table) = &spec.table_name {
            return table.clone();
        }
        let models = self.models.read().clone();
        if let Some(existing) = models.get(&spec.name) {
            return existing.table_name().to_string();
        }
        let taken: HashSet<String> = models
            .values()
            .map(|m| m.table_name().to_string())
            .collect();
        unique_table_name(&default_table_name(&self.table_prefix, &spec.name), &taken)
    }

    /// Removes `model_name`; returns whether it was registered.
    pub fn unregister(&self, model_name: &str) -> bool {
        let _guard = self.mutation.lock();
        let removed = self.models.read().get(model_name).cloned();
        let Some(handle) = removed else {
            return false;
        };
        self.cache.write().remove(handle.cache_key());
        self.roles.write().remove(model_name);
        self.swap_models(|models| {
            models.remove(model_name);
        });
        info!(model = model_name, "model unregistered");
        true
    }

    pub fn lookup(&self, model_name: &str) -> Option<Arc<RuntimeModel>> {
        self.warm();
        self.models.read().get(model_name).cloned()
    }

    /// Like [`lookup`](Self::lookup) but fails with `ModelNotFound`.
    pub fn require(&self, model_name: &str) -> Result<Arc<RuntimeModel>> {
        self.lookup(model_name)
            .ok_or_else(|| DbError::ModelNotFound(model_name.to_string()))
    }

    pub fn contains(&self, model_name: &str) -> bool {
        self.lookup(model_name).is_some()
    }

    /// Sorted copy of the registered names.
    pub fn list_names(&self) -> Vec<String> {
        self.warm();
        let mut names: Vec<String> = self.models.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Copy of the registry contents.
    pub fn get_all(&self) -> HashMap<String, Arc<RuntimeModel>> {
        self.warm();
        self.models.read().as_ref().clone()
    }

    pub fn len(&self) -> usize {
        self.list_names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Model-level roles recorded by [`register`](Self::register).
    pub fn model_roles(&self, model_name: &str) -> BTreeSet<String> {
        self.roles
            .read()
            .get(model_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Finds the child model and foreign key behind `owner.related`.
    pub fn find_relation(&self, owner: &str, related: &str) -> Option<(Arc<RuntimeModel>, FieldSpec)> {
        let models = self.models.read().clone();
        let mut names: Vec<&String> = models.keys().collect();
        names.sort();
        names.into_iter().find_map(|name| {
            let child = &models[name];
            child
                .foreign_keys()
                .find(|(fk, target)| {
                    *target == owner && child.related_name(fk).as_deref() == Some(related)
                })
                .map(|(fk, _)| (Arc::clone(child), fk.clone()))
        })
    }

    /// Tables of registered models that do not exist in the database.
    pub fn verify_tables(&self) -> Result<Vec<String>> {
        let models = self.get_all();
        let mut conn = self.source.acquire()?;
        self.synchronizer
            .verify_tables(conn.as_mut(), models.values().map(|m| m.table_name()))
    }

    /// Loads active models from the store once.
    ///
    /// Check, lock, check again: after the first successful load the fast
    /// path is a single atomic read.
    pub fn ensure_loaded(&self) -> Result<()> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let _load = self.load_lock.lock();
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(store) = &self.store {
            let specs: Vec<ModelSpec> = store
                .load_models()?
                .into_iter()
                .filter(|spec| spec.active)
                .collect();
            self.load_specs(specs);
        }

        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Drops every handle and forgets that the store was loaded.
    pub fn reset(&self) {
        let _guard = self.mutation.lock();
        self.cache.write().clear();
        self.roles.write().clear();
        *self.models.write() = Arc::new(HashMap::new());
        self.loaded.store(false, Ordering::Release);
        debug!("model registry reset");
    }

    /// Registers `specs`, retrying the ones whose foreign-key targets were
    /// not registered yet. Failures are logged and skipped.
    fn load_specs(&self, mut pending: Vec<ModelSpec>) {
        loop {
            let mut failed = Vec::new();
            let mut errors = Vec::new();
            let before = pending.len();
            for spec in pending {
                match self.register(&spec) {
                    Ok(_) => debug!(model = %spec.name, "model loaded from store"),
                    Err(err) => {
                        errors.push(err);
                        failed.push(spec);
                    }
                }
            }
            if failed.is_empty() {
                return;
            }
            if failed.len() == before {
                for (spec, err) in failed.iter().zip(errors) {
                    error!(model = %spec.name, error = %err, "skipping model that failed to load");
                }
                return;
            }
            pending = failed;
        }
    }

    fn warm(&self) {
        if let Err(err) = self.ensure_loaded() {
            error!(error = %err, "loading models from the spec store failed");
        }
    }

    fn ensure_named(&self, handle: &Arc<RuntimeModel>) {
        let registered = self
            .models
            .read()
            .get(handle.name())
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if !registered {
            self.swap_models(|models| {
                models.insert(handle.name().to_string(), Arc::clone(handle));
            });
        }
    }

    fn swap_models(&self, change: impl FnOnce(&mut ModelMap)) {
        let mut guard = self.models.write();
        let mut next = guard.as_ref().clone();
        change(&mut next);
        *guard = Arc::new(next);
    }

    /// Resolves foreign-key targets to tables; targets must be registered
    /// or be the model itself.
    fn table_options(
        &self,
        model_name: &str,
        table_name: &str,
        fields: &[FieldSpec],
        models: &ModelMap,
    ) -> Result<TableOptions> {
        let mut options = TableOptions::new();
        for field in fields {
            if let FieldKind::ForeignKey { to, .. } = &field.kind {
                let target_table = if to == model_name {
                    table_name.to_string()
                } else {
                    models
                        .get(to)
                        .map(|m| m.table_name().to_string())
                        .ok_or_else(|| {
                            DbError::Validation(format!(
                                "Model '{}': foreign key '{}' targets unregistered model '{}'",
                                model_name, field.name, to
                            ))
                        })?
                };
                options = options.foreign_table(field.name.clone(), target_table);
            }
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionPool};
    use crate::store::MemorySpecStore;

    fn registry() -> ModelRegistry {
        let pool = ConnectionPool::new(ConnectionConfig::in_memory()).unwrap();
        ModelRegistry::new(Arc::new(pool))
    }

    fn invoice_fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("total", FieldKind::decimal(10, 2)),
            FieldSpec::new("status", FieldKind::char(20)),
        ]
    }

    #[test]
    fn test_cache_hit_returns_same_handle() {
        let registry = registry();
        let a = registry.get_or_build("Invoice", "inv", &invoice_fields()).unwrap();
        let mut reordered = invoice_fields();
        reordered.reverse();
        let b = registry.get_or_build("Invoice", "inv", &reordered).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.list_names(), vec!["Invoice".to_string()]);
    }

    #[test]
    fn test_invalid_field_registers_nothing() {
        let registry = registry();
        let err = registry
            .get_or_build("Invoice", "inv", &[FieldSpec::new("update_time", FieldKind::DateTime)])
            .unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
        assert!(registry.lookup("Invoice").is_none());

        let mut conn = registry.source().acquire().unwrap();
        assert!(!conn.table_exists("inv").unwrap());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = registry();
        registry.get_or_build("Invoice", "inv", &invoice_fields()).unwrap();
        assert!(registry.unregister("Invoice"));
        assert!(!registry.unregister("Invoice"));
        assert!(registry.lookup("Invoice").is_none());
    }

    #[test]
    fn test_get_all_is_a_copy() {
        let registry = registry();
        registry.get_or_build("Invoice", "inv", &invoice_fields()).unwrap();
        let mut snapshot = registry.get_all();
        snapshot.clear();
        assert!(registry.contains("Invoice"));
    }

    #[test]
    fn test_foreign_key_target_must_exist() {
        let registry = registry();
        let line = [FieldSpec::new("invoice", FieldKind::foreign_key("Invoice"))];
        assert!(registry.get_or_build("Line", "line", &line).is_err());

        registry.get_or_build("Invoice", "inv", &invoice_fields()).unwrap();
        registry.get_or_build("Line", "line", &line).unwrap();
        let (child, fk) = registry.find_relation("Invoice", "line_set").unwrap();
        assert_eq!(child.name(), "Line");
        assert_eq!(fk.column_name(), "invoice_id");
    }

    #[test]
    fn test_table_names_are_unique() {
        let registry = registry();
        registry.register(&ModelSpec::new("Order").fields(invoice_fields())).unwrap();
        let taken = registry.require("Order").unwrap();
        assert_eq!(taken.table_name(), "lowcode_order");

        let clash = ModelSpec::new("ORDER").fields(invoice_fields());
        assert_eq!(registry.resolve_table_name(&clash), "lowcode_order_1");

        let explicit = ModelSpec::new("Other").table_name("lowcode_order");
        assert!(registry.register(&explicit.fields(invoice_fields())).is_err());
    }

    #[test]
    fn test_lazy_load_from_store_in_dependency_order() {
        let store = Arc::new(MemorySpecStore::new());
        store
            .save_model(
                &ModelSpec::new("Line")
                    .field(FieldSpec::new("invoice", FieldKind::foreign_key("Invoice"))),
            )
            .unwrap();
        store
            .save_model(&ModelSpec::new("Invoice").fields(invoice_fields()))
            .unwrap();
        store
            .save_model(&ModelSpec::new("Archived").active(false))
            .unwrap();

        let registry = registry().with_store(store);
        assert!(!registry.is_loaded());
        assert_eq!(registry.list_names(), vec!["Invoice".to_string(), "Line".to_string()]);
        assert!(registry.is_loaded());

        registry.reset();
        assert!(!registry.is_loaded());
        assert_eq!(registry.len(), 2);
    }
}
