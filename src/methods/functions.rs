use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::context::{MethodArgs, MethodContext};
use crate::core::{DbError, Result, Value};
use crate::schema::naming::validate_identifier;

pub const DEFAULT_ALLOWED_FUNCTION_PREFIXES: &[&str] = &["lowcode.methods."];

/// Host-provided implementation behind a `custom_func` method.
pub type CustomFunction =
    Arc<dyn Fn(&mut MethodContext<'_>, &MethodArgs) -> anyhow::Result<Value> + Send + Sync>;

/// Dotted path → function table guarded by a prefix allow-list.
///
/// Both registration and resolution check the allow-list, so a path outside
/// it can never be called even if it was registered under an older list.
pub struct FunctionRegistry {
    allowed_prefixes: Vec<String>,
    functions: RwLock<HashMap<String, CustomFunction>>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_FUNCTION_PREFIXES.iter().map(|p| p.to_string()))
    }
}

impl FunctionRegistry {
    pub fn new<I, S>(allowed_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_prefixes: allowed_prefixes.into_iter().map(Into::into).collect(),
            functions: RwLock::new(HashMap::new()),
        }
    }

    pub fn allowed_prefixes(&self) -> &[String] {
        &self.allowed_prefixes
    }

    /// Well-formed dotted path under one of the allowed prefixes.
    pub fn is_allowed(&self, path: &str) -> bool {
        let well_formed = path.contains('.')
            && path
                .split('.')
                .all(|segment| validate_identifier("Path segment", segment).is_ok());
        well_formed
            && self
                .allowed_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn check_path(&self, path: &str) -> Result<()> {
        if self.is_allowed(path) {
            Ok(())
        } else {
            Err(DbError::ForbiddenFunctionPath(path.to_string()))
        }
    }

    pub fn register<F>(&self, path: &str, function: F) -> Result<()>
    where
        F: Fn(&mut MethodContext<'_>, &MethodArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.check_path(path)?;
        self.functions
            .write()
            .insert(path.to_string(), Arc::new(function));
        debug!(path, "custom function registered");
        Ok(())
    }

    pub fn unregister(&self, path: &str) -> bool {
        self.functions.write().remove(path).is_some()
    }

    pub fn resolve(&self, path: &str) -> Result<CustomFunction> {
        self.check_path(path)?;
        self.functions
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| DbError::FunctionNotFound(path.to_string()))
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.functions.read().keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list() {
        let functions = FunctionRegistry::default();
        assert!(functions.is_allowed("lowcode.methods.discount"));
        assert!(!functions.is_allowed("os.system"));
        assert!(!functions.is_allowed("lowcode.methods."));
        assert!(!functions.is_allowed("lowcode.methods.bad-name"));
        assert!(!functions.is_allowed("discount"));
    }

    #[test]
    fn test_register_outside_allow_list_fails_closed() {
        let functions = FunctionRegistry::default();
        let err = functions
            .register("app.internal.drop_all", |_, _| Ok(Value::Null))
            .unwrap_err();
        assert!(matches!(err, DbError::ForbiddenFunctionPath(_)));
        assert!(functions.paths().is_empty());
    }

    #[test]
    fn test_resolve() {
        let functions = FunctionRegistry::new(["acme."]);
        functions
            .register("acme.pricing.discount", |_, _| Ok(Value::Float(0.1)))
            .unwrap();

        assert!(functions.resolve("acme.pricing.discount").is_ok());
        assert!(matches!(
            functions.resolve("acme.pricing.missing"),
            Err(DbError::FunctionNotFound(_))
        ));
        assert!(matches!(
            functions.resolve("other.pricing.discount"),
            Err(DbError::ForbiddenFunctionPath(_))
        ));
    }
}
