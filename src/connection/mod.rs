pub mod config;
pub mod pool;
pub mod sqlite;

use crate::core::{Result, Row, Value};
use crate::schema::dialect::Dialect;

pub use config::{ConnectionConfig, DatabaseLocation};
pub use pool::{ConnectionPool, PoolGuard, PoolStats};
pub use sqlite::SqliteConnection;

/// A live connection to the relational database being driven.
///
/// Every literal travels as a bound parameter; implementations never splice
/// values into SQL text. Identifiers are quoted by the caller through
/// [`Dialect::quote_ident`].
pub trait SqlConnection {
    fn dialect(&self) -> Dialect;

    /// Executes a statement and returns the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize>;

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Whether a transaction is currently open on this connection.
    fn in_transaction(&self) -> bool;

    /// Id generated by the most recent insert on this connection.
    fn last_insert_id(&mut self) -> Result<i64>;

    fn table_exists(&mut self, table: &str) -> Result<bool> {
        let sql = self.dialect().table_exists_sql();
        let rows = self.query(&sql, &[Value::Text(table.to_string())])?;
        Ok(!rows.is_empty())
    }

    fn column_names(&mut self, table: &str) -> Result<Vec<String>> {
        let sql = self.dialect().column_names_sql();
        let rows = self.query(&sql, &[Value::Text(table.to_string())])?;
        Ok(rows
            .iter()
            .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string))
            .collect())
    }
}

/// Hands out connections; implemented by [`ConnectionPool`].
pub trait ConnectionSource: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn acquire(&self) -> Result<Box<dyn SqlConnection>>;
}
