use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::config::{ConnectionConfig, DatabaseLocation};
use super::sqlite::SqliteConnection;
use super::{ConnectionSource, SqlConnection};
use crate::core::{DbError, Result, Row, Value};
use crate::schema::dialect::Dialect;

/// Connection pool
///
/// Keeps idle SQLite connections for reuse. Callers block (up to
/// `connect_timeout`) when `max_connections` are all checked out.
pub struct ConnectionPool {
    config: ConnectionConfig,
    shared: Arc<PoolShared>,
    next_id: AtomicU64,
    /// Keeps a named in-memory database alive while the pool exists.
    anchor: Option<Mutex<SqliteConnection>>,
}

struct PoolShared {
    available: Mutex<VecDeque<PooledConnection>>,
    returned: Condvar,
    total_connections: AtomicUsize,
}

/// A connection from the pool
struct PooledConnection {
    connection: SqliteConnection,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: SqliteConnection) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime.is_some_and(|lifetime| self.created_at.elapsed() > lifetime)
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        idle_timeout.is_some_and(|timeout| self.last_used.elapsed() > timeout)
    }
}

impl ConnectionPool {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate().map_err(DbError::Validation)?;

        let anchor = match config.location {
            DatabaseLocation::Memory(_) => Some(Mutex::new(SqliteConnection::open(&config, 0)?)),
            DatabaseLocation::File(_) => None,
        };

        let pool = Self {
            config,
            shared: Arc::new(PoolShared {
                available: Mutex::new(VecDeque::new()),
                returned: Condvar::new(),
                total_connections: AtomicUsize::new(0),
            }),
            next_id: AtomicU64::new(1),
            anchor,
        };

        pool.ensure_min_connections()?;
        debug!(url = %pool.config.to_url(), "connection pool ready");
        Ok(pool)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> Result<PoolGuard> {
        let start = Instant::now();
        let mut available = self.shared.available.lock()?;

        loop {
            let removed = self.evict_stale(&mut available);
            if removed > 0 {
                self.shared.total_connections.fetch_sub(removed, Ordering::SeqCst);
            }

            if let Some(pooled) = available.pop_front() {
                return Ok(self.guard(pooled.connection, pooled.created_at));
            }

            if self.shared.total_connections.load(Ordering::SeqCst) < self.config.max_connections {
                self.shared.total_connections.fetch_add(1, Ordering::SeqCst);
                drop(available);
                return match self.open_connection() {
                    Ok(connection) => Ok(self.guard(connection, Instant::now())),
                    Err(err) => {
                        self.shared.total_connections.fetch_sub(1, Ordering::SeqCst);
                        Err(err)
                    }
                };
            }

            let elapsed = start.elapsed();
            if elapsed >= self.config.connect_timeout {
                return Err(DbError::TransientDatabase(
                    "Connection pool timeout: no connections available".into(),
                ));
            }
            let (guard, _) = self
                .shared
                .returned
                .wait_timeout(available, self.config.connect_timeout - elapsed)?;
            available = guard;
        }
    }

    fn guard(&self, connection: SqliteConnection, created_at: Instant) -> PoolGuard {
        PoolGuard {
            connection: Some(connection),
            created_at,
            shared: Arc::clone(&self.shared),
        }
    }

    fn evict_stale(&self, available: &mut VecDeque<PooledConnection>) -> usize {
        let before = available.len();
        available.retain(|pooled| {
            !pooled.is_expired(self.config.max_lifetime)
                && !pooled.is_idle_too_long(self.config.idle_timeout)
        });
        before - available.len()
    }

    fn open_connection(&self) -> Result<SqliteConnection> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        SqliteConnection::open(&self.config, id)
    }

    /// Ensure minimum number of connections
    fn ensure_min_connections(&self) -> Result<()> {
        let mut available = self.shared.available.lock()?;
        while self.shared.total_connections.load(Ordering::SeqCst) < self.config.min_connections {
            available.push_back(PooledConnection::new(self.open_connection()?));
            self.shared.total_connections.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let available = self
            .shared
            .available
            .lock()
            .map(|queue| queue.len())
            .unwrap_or(0);
        let total = self.shared.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available,
            active_connections: total.saturating_sub(available),
            max_connections: self.config.max_connections,
        }
    }

    /// Whether this pool pins a shared in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.anchor.is_some()
    }
}

impl ConnectionSource for ConnectionPool {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn acquire(&self) -> Result<Box<dyn SqlConnection>> {
        Ok(Box::new(self.get_connection()?))
    }
}

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// RAII guard for pooled connections
///
/// Returns the connection to the pool when dropped. An open transaction is
/// rolled back first; a connection that cannot be rolled back is discarded.
pub struct PoolGuard {
    connection: Option<SqliteConnection>,
    created_at: Instant,
    shared: Arc<PoolShared>,
}

impl PoolGuard {
    fn conn(&self) -> &SqliteConnection {
        self.connection
            .as_ref()
            .expect("connection is present until the guard drops")
    }

    fn conn_mut(&mut self) -> &mut SqliteConnection {
        self.connection
            .as_mut()
            .expect("connection is present until the guard drops")
    }
}

impl Deref for PoolGuard {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        self.conn()
    }
}

impl DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn_mut()
    }
}

impl SqlConnection for PoolGuard {
    fn dialect(&self) -> Dialect {
        self.conn().dialect()
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        self.conn_mut().execute(sql, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.conn_mut().query(sql, params)
    }

    fn begin(&mut self) -> Result<()> {
        self.conn_mut().begin()
    }

    fn commit(&mut self) -> Result<()> {
        self.conn_mut().commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn_mut().rollback()
    }

    fn in_transaction(&self) -> bool {
        self.conn().in_transaction()
    }

    fn last_insert_id(&mut self) -> Result<i64> {
        self.conn_mut().last_insert_id()
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        if connection.in_transaction() {
            warn!(
                connection = connection.id(),
                "PoolGuard dropped with active transaction, rolling back"
            );
            if connection.rollback().is_err() {
                self.shared.total_connections.fetch_sub(1, Ordering::SeqCst);
                self.shared.returned.notify_one();
                return;
            }
        }

        match self.shared.available.lock() {
            Ok(mut available) => {
                available.push_back(PooledConnection {
                    connection,
                    created_at: self.created_at,
                    last_used: Instant::now(),
                });
                self.shared.returned.notify_one();
            }
            Err(_) => {
                self.shared.total_connections.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let config = ConnectionConfig::in_memory()
            .min_connections(2)
            .max_connections(5);

        let pool = ConnectionPool::new(config).unwrap();
        let stats = pool.stats();

        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.available_connections, 2);
        assert!(pool.is_in_memory());
    }

    #[test]
    fn test_connection_return_to_pool() {
        let config = ConnectionConfig::in_memory()
            .min_connections(1)
            .max_connections(5);
        let pool = ConnectionPool::new(config).unwrap();

        {
            let _conn = pool.get_connection().unwrap();
            let stats = pool.stats();
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.available_connections, 0);
        }

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.available_connections, 1);
    }

    #[test]
    fn test_connections_share_named_memory_database() {
        let pool = ConnectionPool::new(ConnectionConfig::in_memory().max_connections(2)).unwrap();

        let mut first = pool.get_connection().unwrap();
        first.execute("CREATE TABLE shared_t (id INTEGER)", &[]).unwrap();
        let mut second = pool.get_connection().unwrap();
        assert!(second.table_exists("shared_t").unwrap());
    }

    #[test]
    fn test_pool_timeout_when_exhausted() {
        let config = ConnectionConfig::in_memory()
            .max_connections(1)
            .connect_timeout(Duration::from_millis(50));
        let pool = ConnectionPool::new(config).unwrap();

        let _held = pool.get_connection().unwrap();
        let err = pool.get_connection().err().unwrap();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() {
        let pool = ConnectionPool::new(ConnectionConfig::in_memory().max_connections(1)).unwrap();
        {
            let mut conn = pool.get_connection().unwrap();
            conn.execute("CREATE TABLE rb (id INTEGER)", &[]).unwrap();
            conn.begin().unwrap();
            conn.execute("INSERT INTO rb VALUES (1)", &[]).unwrap();
        }

        let mut conn = pool.get_connection().unwrap();
        assert!(!conn.in_transaction());
        assert!(conn.query("SELECT * FROM rb", &[]).unwrap().is_empty());
    }
}
