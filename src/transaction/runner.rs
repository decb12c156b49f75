use std::thread;
use std::time::Instant;

use log::warn;
use tracing::{debug, error};

use super::policy::TransactionPolicy;
use crate::connection::{ConnectionSource, SqlConnection};
use crate::core::Result;

/// Executes units of work inside the database's native transaction, retrying
/// transient failures according to a [`TransactionPolicy`].
///
/// The timeout is advisory: it is checked between attempts, and an attempt
/// that overruns is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct TransactionRunner {
    policy: TransactionPolicy,
}

impl TransactionRunner {
    pub fn new(policy: TransactionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TransactionPolicy {
        &self.policy
    }

    /// Runs `unit` atomically on `conn`.
    ///
    /// When `conn` already has an open transaction the unit joins it: no new
    /// transaction is started and no retry happens at this level, so the
    /// failure reaches the enclosing `run`.
    pub fn run<T, F>(&self, conn: &mut dyn SqlConnection, mut unit: F) -> Result<T>
    where
        F: FnMut(&mut dyn SqlConnection) -> Result<T>,
    {
        if conn.in_transaction() {
            debug!("joining enclosing transaction");
            return unit(conn);
        }

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let err = match Self::attempt(conn, &mut unit) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if started.elapsed() > self.policy.timeout {
                warn!(
                    "transaction timeout budget {:?} exhausted after attempt {}: {}",
                    self.policy.timeout,
                    attempt + 1,
                    err
                );
                return Err(err);
            }
            if attempt >= self.policy.retry_times || !self.policy.is_retryable(&err) {
                return Err(err);
            }

            let backoff = self.policy.backoff(attempt);
            warn!(
                "transaction retry on transient error (attempt {} of {}): {} (backoff={:?})",
                attempt + 1,
                self.policy.retry_times + 1,
                err,
                backoff
            );
            thread::sleep(backoff);
            attempt += 1;
        }
    }

    /// Acquires one connection from `source` and runs `unit` on it.
    pub fn run_with<T, F>(&self, source: &dyn ConnectionSource, unit: F) -> Result<T>
    where
        F: FnMut(&mut dyn SqlConnection) -> Result<T>,
    {
        let mut conn = source.acquire()?;
        self.run(conn.as_mut(), unit)
    }

    fn attempt<T, F>(conn: &mut dyn SqlConnection, unit: &mut F) -> Result<T>
    where
        F: FnMut(&mut dyn SqlConnection) -> Result<T>,
    {
        conn.begin()?;
        let outcome = unit(conn).and_then(|value| conn.commit().map(|_| value));
        if outcome.is_err() && conn.in_transaction() {
            if let Err(rollback_err) = conn.rollback() {
                error!(error = %rollback_err, "rollback failed after transaction error");
            }
        }
        outcome
    }
}

/// Runs `unit` on `conn` under `policy`.
pub fn run<T, F>(conn: &mut dyn SqlConnection, policy: &TransactionPolicy, unit: F) -> Result<T>
where
    F: FnMut(&mut dyn SqlConnection) -> Result<T>,
{
    TransactionRunner::new(policy.clone()).run(conn, unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SqliteConnection;
    use crate::core::{DbError, Value};
    use std::time::Duration;

    fn fast_policy(retry_times: u32) -> TransactionPolicy {
        TransactionPolicy::default()
            .retry_times(retry_times)
            .retry_delay(Duration::from_millis(1))
    }

    fn setup() -> SqliteConnection {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE ledger (amount INTEGER)", &[]).unwrap();
        conn
    }

    fn count(conn: &mut SqliteConnection) -> i64 {
        let rows = conn.query("SELECT COUNT(*) FROM ledger", &[]).unwrap();
        rows[0].first().and_then(Value::as_i64).unwrap()
    }

    #[test]
    fn test_retries_then_succeeds() {
        let mut conn = setup();
        let mut attempts = 0;
        let result = run(&mut conn, &fast_policy(2), |tx| {
            attempts += 1;
            tx.execute("INSERT INTO ledger VALUES (?)", &[Value::Integer(attempts)])?;
            if attempts <= 2 {
                return Err(DbError::TransientDatabase("deadlock detected".into()));
            }
            Ok(attempts)
        })
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(attempts, 3);
        // failed attempts were rolled back
        assert_eq!(count(&mut conn), 1);
    }

    #[test]
    fn test_always_failing_raises_after_all_attempts() {
        let mut conn = setup();
        let mut attempts = 0;
        let err = run(&mut conn, &fast_policy(2), |_| -> Result<()> {
            attempts += 1;
            Err(DbError::FatalDatabase(format!("Lock wait timeout exceeded #{}", attempts)))
        })
        .unwrap_err();

        assert_eq!(attempts, 3);
        assert!(err.to_string().contains("#3"));
    }

    #[test]
    fn test_non_matching_error_is_not_retried() {
        let mut conn = setup();
        let mut attempts = 0;
        let err = run(&mut conn, &fast_policy(5), |_| -> Result<()> {
            attempts += 1;
            Err(DbError::Validation("amount must be positive".into()))
        })
        .unwrap_err();

        assert_eq!(attempts, 1);
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn test_timeout_budget_stops_retries() {
        let mut conn = setup();
        let policy = fast_policy(10).timeout(Duration::from_millis(20));
        let mut attempts = 0;
        let result: Result<()> = run(&mut conn, &policy, |_| {
            attempts += 1;
            thread::sleep(Duration::from_millis(30));
            Err(DbError::TransientDatabase("deadlock".into()))
        });

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_nested_run_joins_enclosing_transaction() {
        let mut conn = setup();
        let policy = fast_policy(2);
        let outcome: Result<()> = run(&mut conn, &policy, |outer| {
            outer.execute("INSERT INTO ledger VALUES (1)", &[])?;
            run(outer, &policy, |inner| {
                assert!(inner.in_transaction());
                inner.execute("INSERT INTO ledger VALUES (2)", &[])?;
                Ok(())
            })?;
            Err(DbError::Validation("abort outer".into()))
        });

        assert!(outcome.is_err());
        assert!(!conn.in_transaction());
        assert_eq!(count(&mut conn), 0);
    }
}
