//! Model declarations, runtime handles and the name → handle registry.

pub mod model;
#[allow(clippy::module_inception)]
pub mod registry;
pub mod spec;

pub use model::{RuntimeModel, SYSTEM_FIELD_NAMES, cache_key, is_system_field, system_fields};
pub use registry::{DEFAULT_TABLE_PREFIX, ModelRegistry};
pub use spec::ModelSpec;
