//! Transaction retry engine.

pub mod policy;
pub mod runner;

pub use policy::{DEFAULT_RETRYABLE_PATTERNS, TransactionPolicy};
pub use runner::{TransactionRunner, run};
