//! Audit trail of method calls.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Argument keys whose values never reach an audit sink.
pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "auth",
    "key",
    "credential",
    "pin",
    "ssn",
];

pub const REDACTED: &str = "***";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success { result: serde_json::Value },
    Failure { error: String },
}

impl AuditOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// One method call, as recorded after it finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub caller: String,
    pub model: String,
    pub method: String,
    pub instance_id: i64,
    pub args: serde_json::Value,
    pub outcome: AuditOutcome,
    pub elapsed_ms: u64,
}

/// Receives audit entries. A failing sink never affects the audited call.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> anyhow::Result<()>;
}

/// Emits entries as `tracing` events under the `dynaschema::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let args = serde_json::to_string(&entry.args)?;
        match &entry.outcome {
            AuditOutcome::Success { result } => tracing::info!(
                target: "dynaschema::audit",
                audit_id = %entry.id,
                caller = %entry.caller,
                model = %entry.model,
                method = %entry.method,
                instance_id = entry.instance_id,
                args = %args,
                result = %result,
                elapsed_ms = entry.elapsed_ms,
                "method call succeeded"
            ),
            AuditOutcome::Failure { error } => tracing::warn!(
                target: "dynaschema::audit",
                audit_id = %entry.id,
                caller = %entry.caller,
                model = %entry.model,
                method = %entry.method,
                instance_id = entry.instance_id,
                args = %args,
                error = %error,
                elapsed_ms = entry.elapsed_ms,
                "method call failed"
            ),
        }
        Ok(())
    }
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Replaces the value of every key containing a sensitive word, at any depth.
pub fn sanitize(value: &serde_json::Value, sensitive_keys: &[String]) -> serde_json::Value {
    match value {
        serde_json::Value::Object(object) => serde_json::Value::Object(
            object
                .iter()
                .map(|(key, inner)| {
                    let lowered = key.to_lowercase();
                    let redacted = sensitive_keys
                        .iter()
                        .any(|word| lowered.contains(&word.to_lowercase()));
                    let cleaned = if redacted {
                        serde_json::Value::String(REDACTED.into())
                    } else {
                        sanitize(inner, sensitive_keys)
                    };
                    (key.clone(), cleaned)
                })
                .collect(),
        ),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|item| sanitize(item, sensitive_keys)).collect(),
        ),
        other => other.clone(),
    }
}

pub fn default_sensitive_keys() -> Vec<String> {
    DEFAULT_SENSITIVE_KEYS.iter().map(|k| k.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_redacts_nested_keys() {
        let args = json!({
            "args": [{"api_key": "abc", "amount": 3}],
            "kwargs": {"Password": "hunter2", "note": "ok"}
        });
        let cleaned = sanitize(&args, &default_sensitive_keys());

        assert_eq!(cleaned["args"][0]["api_key"], REDACTED);
        assert_eq!(cleaned["args"][0]["amount"], 3);
        assert_eq!(cleaned["kwargs"]["Password"], REDACTED);
        assert_eq!(cleaned["kwargs"]["note"], "ok");
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let outcome = AuditOutcome::Failure {
            error: "denied".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json, json!({"status": "failure", "error": "denied"}));
    }
}
