use parking_lot::RwLock;

use super::{SpecDocument, SpecStore};
use crate::core::Result;
use crate::methods::spec::MethodSpec;
use crate::registry::spec::ModelSpec;

/// Process-local store, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySpecStore {
    document: RwLock<SpecDocument>,
}

impl MemorySpecStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: SpecDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    pub fn snapshot(&self) -> SpecDocument {
        self.document.read().clone()
    }
}

impl SpecStore for MemorySpecStore {
    fn load_models(&self) -> Result<Vec<ModelSpec>> {
        Ok(self.document.read().models.clone())
    }

    fn load_methods(&self) -> Result<Vec<MethodSpec>> {
        Ok(self.document.read().methods.clone())
    }

    fn save_model(&self, spec: &ModelSpec) -> Result<()> {
        self.document.write().upsert_model(spec);
        Ok(())
    }

    fn remove_model(&self, name: &str) -> Result<bool> {
        Ok(self.document.write().remove_model(name))
    }

    fn save_method(&self, spec: &MethodSpec) -> Result<()> {
        self.document.write().upsert_method(spec);
        Ok(())
    }

    fn remove_method(&self, model: &str, method: &str) -> Result<bool> {
        Ok(self.document.write().remove_method(model, method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_and_cascade_remove() {
        let store = MemorySpecStore::new();
        store.save_model(&ModelSpec::new("Invoice")).unwrap();
        store
            .save_model(&ModelSpec::new("Invoice").allow_role("admin"))
            .unwrap();
        store
            .save_method(&MethodSpec::field_update("Invoice", "mark_paid", json!({"field": "status"})))
            .unwrap();

        let models = store.load_models().unwrap();
        assert_eq!(models.len(), 1);
        assert!(models[0].allowed_roles.contains("admin"));
        assert_eq!(store.methods_of("Invoice").unwrap().len(), 1);

        assert!(store.remove_model("Invoice").unwrap());
        assert!(store.load_methods().unwrap().is_empty());
        assert!(!store.remove_model("Invoice").unwrap());
    }
}
