use rusqlite::{OpenFlags, params_from_iter};
use tracing::trace;

use super::SqlConnection;
use super::config::{ConnectionConfig, DatabaseLocation};
use crate::core::{DbError, Result, Row, Value};
use crate::schema::dialect::Dialect;

/// SQLite connection backed by rusqlite.
pub struct SqliteConnection {
    id: u64,
    inner: rusqlite::Connection,
}

impl SqliteConnection {
    /// Opens a connection as described by `config`.
    pub fn open(config: &ConnectionConfig, id: u64) -> Result<Self> {
        let inner = match &config.location {
            DatabaseLocation::File(path) => rusqlite::Connection::open(path)?,
            DatabaseLocation::Memory(name) => rusqlite::Connection::open_with_flags(
                format!("file:{}?mode=memory&cache=shared", name),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };

        inner.busy_timeout(config.busy_timeout)?;
        inner.execute_batch("PRAGMA foreign_keys = ON;")?;
        if config.journal_wal && matches!(config.location, DatabaseLocation::File(_)) {
            inner.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        }

        Ok(Self { id, inner })
    }

    /// Private in-memory database, not shared with any other connection.
    pub fn open_in_memory() -> Result<Self> {
        let inner = rusqlite::Connection::open_in_memory()?;
        inner.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { id: 0, inner })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runs a trivial statement to check the connection is still usable.
    pub fn ping(&self) -> bool {
        self.inner.execute_batch("SELECT 1;").is_ok()
    }
}

impl SqlConnection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        trace!(connection = self.id, sql, "execute");
        let mut stmt = self.inner.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter()))?)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        trace!(connection = self.id, sql, "query");
        let mut stmt = self.inner.prepare_cached(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let values = (0..columns.len())
                .map(|idx| row.get::<_, Value>(idx))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            result.push(Row::new(columns.clone(), values));
        }
        Ok(result)
    }

    fn begin(&mut self) -> Result<()> {
        if self.in_transaction() {
            return Err(DbError::UnsupportedOperation(
                "Transaction already active on this connection".into(),
            ));
        }
        self.inner.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.inner.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.in_transaction() {
            self.inner.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.inner.is_autocommit()
    }

    fn last_insert_id(&mut self) -> Result<i64> {
        Ok(self.inner.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_and_query_bind_parameters() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, paid INTEGER)", &[])
            .unwrap();
        conn.execute(
            "INSERT INTO t (name, paid) VALUES (?, ?)",
            &[Value::Text("it's".into()), Value::Boolean(true)],
        )
        .unwrap();
        assert_eq!(conn.last_insert_id().unwrap(), 1);

        let rows = conn
            .query("SELECT name, paid FROM t WHERE id = ?", &[Value::Integer(1)])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::Text("it's".into())));
        assert_eq!(rows[0].get("paid"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_transaction_state_follows_engine() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();

        conn.begin().unwrap();
        assert!(conn.in_transaction());
        assert!(conn.begin().is_err());
        conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        conn.rollback().unwrap();
        assert!(!conn.in_transaction());

        let rows = conn.query("SELECT * FROM t", &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_catalog_queries() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE invoice (id INTEGER, total REAL)", &[]).unwrap();
        assert!(conn.table_exists("invoice").unwrap());
        assert!(!conn.table_exists("missing").unwrap());
        assert_eq!(conn.column_names("invoice").unwrap(), vec!["id", "total"]);
    }
}
