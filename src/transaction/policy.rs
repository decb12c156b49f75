use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::DbError;

/// Error message fragments that mark a failure as transient.
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    "deadlock",
    "could not serialize",
    "serialization failure",
    "lock wait timeout",
    "lock timeout",
    "concurrent update",
    "database is locked",
    "database table is locked",
];

/// Configuration for retrying a unit of work on transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionPolicy {
    /// Total budget, checked between attempts.
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retry_times: u32,
    /// Base delay; attempt `n` waits `retry_delay * 2^n`.
    #[serde(with = "duration_ms", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
    pub retryable_error_patterns: Vec<String>,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry_times: 2,
            retry_delay: Duration::from_millis(500),
            retryable_error_patterns: DEFAULT_RETRYABLE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl TransactionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn retryable_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.retryable_error_patterns.push(pattern.into());
        self
    }

    /// Replaces the pattern list.
    pub fn retryable_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_error_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Case-insensitive substring match of the error message against the patterns.
    ///
    /// Only database-class errors qualify; validation and permission failures
    /// never do.
    pub fn is_retryable(&self, err: &DbError) -> bool {
        if !err.is_retryable_class() {
            return false;
        }
        let message = err.to_string().to_lowercase();
        self.retryable_error_patterns
            .iter()
            .any(|pattern| message.contains(&pattern.to_lowercase()))
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
