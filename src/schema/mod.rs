//! Field declarations, dialect-aware DDL and table synchronization.

pub mod ddl;
pub mod dialect;
pub mod diff;
pub mod field;
pub mod inference;
pub mod naming;
pub mod resolver;
pub mod synchronizer;

pub use ddl::TableOptions;
pub use dialect::Dialect;
pub use diff::{CompatibilityPolicy, FieldChange, FieldDiff, SafetyVerdict, diff, is_type_compatible, validate};
pub use field::{FieldKind, FieldSpec, FieldType, OnDelete};
pub use resolver::{ColumnType, resolve};
pub use synchronizer::{SchemaSynchronizer, StatementOutcome, StatementResult, SyncReport, TableStatus};
