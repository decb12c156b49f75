//! Authoritative store of model and method declarations.

pub mod json_file;
pub mod memory;

use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::methods::spec::MethodSpec;
use crate::registry::spec::ModelSpec;

pub use json_file::JsonFileSpecStore;
pub use memory::MemorySpecStore;

/// Where declarations live between process restarts.
///
/// The runtime only reads and writes through this trait; saving a spec that
/// already exists replaces it.
pub trait SpecStore: Send + Sync {
    fn load_models(&self) -> Result<Vec<ModelSpec>>;

    fn load_methods(&self) -> Result<Vec<MethodSpec>>;

    fn save_model(&self, spec: &ModelSpec) -> Result<()>;

    /// Removes a model and every method declared on it.
    fn remove_model(&self, name: &str) -> Result<bool>;

    fn save_method(&self, spec: &MethodSpec) -> Result<()>;

    fn remove_method(&self, model: &str, method: &str) -> Result<bool>;

    fn model(&self, name: &str) -> Result<Option<ModelSpec>> {
        Ok(self.load_models()?.into_iter().find(|m| m.name == name))
    }

    fn methods_of(&self, model: &str) -> Result<Vec<MethodSpec>> {
        Ok(self
            .load_methods()?
            .into_iter()
            .filter(|m| m.model_name == model)
            .collect())
    }
}

/// Serialized contents of a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecDocument {
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub methods: Vec<MethodSpec>,
}

impl SpecDocument {
    pub fn upsert_model(&mut self, spec: &ModelSpec) {
        match self.models.iter_mut().find(|m| m.name == spec.name) {
            Some(existing) => *existing = spec.clone(),
            None => self.models.push(spec.clone()),
        }
    }

    pub fn remove_model(&mut self, name: &str) -> bool {
        let before = self.models.len();
        self.models.retain(|m| m.name != name);
        self.methods.retain(|m| m.model_name != name);
        before != self.models.len()
    }

    pub fn upsert_method(&mut self, spec: &MethodSpec) {
        match self
            .methods
            .iter_mut()
            .find(|m| m.model_name == spec.model_name && m.method_name == spec.method_name)
        {
            Some(existing) => *existing = spec.clone(),
            None => self.methods.push(spec.clone()),
        }
    }

    pub fn remove_method(&mut self, model: &str, method: &str) -> bool {
        let before = self.methods.len();
        self.methods
            .retain(|m| !(m.model_name == model && m.method_name == method));
        before != self.methods.len()
    }
}
