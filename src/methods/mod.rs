//! Declarative methods attached to runtime models.
//!
//! A [`MethodSpec`] names one of three templates (aggregate, field update,
//! custom function) plus its parameters. The [`MethodBinder`] turns specs
//! into handlers and runs them behind role and row checks, auditing every
//! call.

pub mod audit;
pub mod binder;
pub mod context;
pub mod functions;
pub mod permission;
pub mod spec;
mod templates;

pub use audit::{
    AuditEntry, AuditOutcome, AuditSink, DEFAULT_SENSITIVE_KEYS, MemoryAuditSink, REDACTED,
    TracingAuditSink, default_sensitive_keys, sanitize,
};
pub use binder::{BindOutcome, BindingState, MethodBinder, MethodHandler, RefreshReport};
pub use context::{Caller, MethodArgs, MethodContext};
pub use functions::{CustomFunction, DEFAULT_ALLOWED_FUNCTION_PREFIXES, FunctionRegistry};
pub use permission::{AllowAllRows, Decision, RoleLookup, RowGrants, StaticPermissions, check_roles, check_row};
pub use spec::{AggregateOp, LogicType, MethodLogic, MethodSpec, load_method_specs};
