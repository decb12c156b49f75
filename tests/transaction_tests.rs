/// Transaction retry tests
///
/// Retried units of work against a SQLite file shared by several connections.
/// Run with: cargo test --test transaction_tests

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use dynaschema::{
    ConnectionConfig, ConnectionPool, DbError, SqlConnection, TransactionPolicy,
    TransactionRunner, Value,
};

fn pool(dir: &tempfile::TempDir) -> ConnectionPool {
    let config = ConnectionConfig::new(dir.path().join("tx.db"))
        .busy_timeout(Duration::from_millis(20))
        .max_connections(4);
    let pool = ConnectionPool::new(config).unwrap();
    pool.get_connection()
        .unwrap()
        .execute("CREATE TABLE ledger (id INTEGER PRIMARY KEY, amount INTEGER NOT NULL)", &[])
        .unwrap();
    pool
}

fn count(conn: &mut dyn SqlConnection) -> i64 {
    conn.query("SELECT COUNT(*) AS n FROM ledger", &[]).unwrap()[0]
        .first()
        .and_then(Value::as_i64)
        .unwrap()
}

#[test]
fn test_failed_attempt_leaves_no_partial_writes() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(&dir);
    let runner = TransactionRunner::new(
        TransactionPolicy::new()
            .retry_times(3)
            .retry_delay(Duration::from_millis(1)),
    );
    let attempts = AtomicU32::new(0);

    let mut conn = pool.get_connection().unwrap();
    let id = runner
        .run(&mut *conn, |tx| {
            tx.execute("INSERT INTO ledger (amount) VALUES (?1)", &[Value::Integer(10)])?;
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(DbError::TransientDatabase("deadlock detected".into()));
            }
            tx.last_insert_id()
        })
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(count(&mut *conn), 1);
    assert!(id > 0);
    assert!(!conn.in_transaction());
}

#[test]
fn test_validation_errors_are_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(&dir);
    let runner = TransactionRunner::new(TransactionPolicy::new().retry_delay(Duration::from_millis(1)));
    let attempts = AtomicU32::new(0);

    let mut conn = pool.get_connection().unwrap();
    let err = runner
        .run(&mut *conn, |tx| {
            attempts.fetch_add(1, Ordering::SeqCst);
            tx.execute("INSERT INTO ledger (amount) VALUES (1)", &[])?;
            Err::<(), _>(DbError::Validation("deadlock in the wording only".into()))
        })
        .unwrap_err();

    assert!(matches!(err, DbError::Validation(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(count(&mut *conn), 0);
}

#[test]
fn test_locked_database_is_retried_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(pool(&dir));
    let locked = Arc::new(Barrier::new(2));

    let holder = {
        let pool = Arc::clone(&pool);
        let locked = Arc::clone(&locked);
        thread::spawn(move || {
            let mut conn = pool.get_connection().unwrap();
            conn.begin().unwrap();
            conn.execute("INSERT INTO ledger (amount) VALUES (1)", &[]).unwrap();
            locked.wait();
            thread::sleep(Duration::from_millis(150));
            conn.commit().unwrap();
        })
    };

    locked.wait();
    let runner = TransactionRunner::new(
        TransactionPolicy::new()
            .retry_times(6)
            .retry_delay(Duration::from_millis(20))
            .timeout(Duration::from_secs(10)),
    );
    let mut conn = pool.get_connection().unwrap();
    runner
        .run(&mut *conn, |tx| {
            tx.execute("INSERT INTO ledger (amount) VALUES (2)", &[])
                .map(|_| ())
        })
        .unwrap();

    holder.join().unwrap();
    assert_eq!(count(&mut *conn), 2);
}

#[test]
fn test_exhausted_retries_surface_last_error() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(&dir);
    let runner = TransactionRunner::new(
        TransactionPolicy::new()
            .retry_times(2)
            .retry_delay(Duration::from_millis(1)),
    );
    let attempts = AtomicU32::new(0);

    let mut conn = pool.get_connection().unwrap();
    let err = runner
        .run(&mut *conn, |_| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Err::<(), _>(DbError::TransientDatabase(format!("database is locked ({})", n)))
        })
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(err.to_string().contains("(3)"));
}
