use std::fmt;

use tracing::{debug, info, warn};

use super::ddl::{self, TableOptions};
use super::field::FieldSpec;
use super::inference;
use super::naming::validate_table_name;
use crate::connection::SqlConnection;
use crate::core::{DbError, Result};

/// Outcome of one DDL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementOutcome {
    Applied,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementResult {
    pub sql: String,
    pub outcome: StatementOutcome,
}

/// What happened to the table as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Created,
    AlreadyPresent,
    Altered,
    Dropped,
    Absent,
}

/// Per-statement account of a synchronization step.
///
/// DDL auto-commits on most engines, so statements that ran before a failure
/// stay applied. The report is the only record of what actually happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub table: String,
    pub status: TableStatus,
    pub statements: Vec<StatementResult>,
}

impl SyncReport {
    fn new(table: &str, status: TableStatus) -> Self {
        Self {
            table: table.to_string(),
            status,
            statements: Vec::new(),
        }
    }

    /// True when every statement applied.
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = &StatementResult> {
        self.statements
            .iter()
            .filter(|s| matches!(s.outcome, StatementOutcome::Failed(_)))
    }

    pub fn applied_count(&self) -> usize {
        self.statements
            .iter()
            .filter(|s| s.outcome == StatementOutcome::Applied)
            .count()
    }

    /// Runs `sql` and records its outcome; the error is returned as well.
    fn apply(&mut self, conn: &mut dyn SqlConnection, sql: String) -> Result<()> {
        match conn.execute(&sql, &[]) {
            Ok(_) => {
                debug!(table = %self.table, sql = %sql, "ddl applied");
                self.statements.push(StatementResult {
                    sql,
                    outcome: StatementOutcome::Applied,
                });
                Ok(())
            }
            Err(err) => {
                self.statements.push(StatementResult {
                    sql,
                    outcome: StatementOutcome::Failed(err.to_string()),
                });
                Err(err)
            }
        }
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?}: {} applied, {} failed",
            self.table,
            self.status,
            self.applied_count(),
            self.failures().count()
        )
    }
}

/// Drives DDL against a caller-supplied connection. Holds no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaSynchronizer;

impl SchemaSynchronizer {
    pub fn new() -> Self {
        Self
    }

    /// Creates `table_name` unless it already exists.
    ///
    /// A failing CREATE TABLE is an error. Index statements that fail are
    /// recorded in the report and logged; the table stays usable.
    pub fn create_table_if_absent(
        &self,
        conn: &mut dyn SqlConnection,
        table_name: &str,
        fields: &[FieldSpec],
        options: &TableOptions,
    ) -> Result<SyncReport> {
        validate_table_name(table_name)?;
        if conn.table_exists(table_name)? {
            debug!(table = table_name, "table already present");
            return Ok(SyncReport::new(table_name, TableStatus::AlreadyPresent));
        }

        let plan = ddl::create_table_plan(conn.dialect(), table_name, fields, options)?;
        let mut report = SyncReport::new(table_name, TableStatus::Created);
        report.apply(conn, plan.create_table)?;

        for sql in plan.create_indexes {
            if let Err(err) = report.apply(conn, sql) {
                warn!(table = table_name, error = %err, "index creation failed");
            }
        }

        info!(
            table = table_name,
            primary_key = plan.primary_key.as_deref().unwrap_or(""),
            "table created"
        );
        Ok(report)
    }

    /// Adds one column. `foreign_table` is the referenced table for a foreign key.
    pub fn add_column(
        &self,
        conn: &mut dyn SqlConnection,
        table_name: &str,
        field: &FieldSpec,
        foreign_table: Option<&str>,
    ) -> Result<SyncReport> {
        validate_table_name(table_name)?;
        let statements = ddl::add_column_sql(conn.dialect(), table_name, field, foreign_table)?;
        let mut report = SyncReport::new(table_name, TableStatus::Altered);
        let mut statements = statements.into_iter();
        if let Some(alter) = statements.next() {
            report.apply(conn, alter)?;
        }
        for sql in statements {
            if let Err(err) = report.apply(conn, sql) {
                warn!(table = table_name, column = %field.name, error = %err, "column index failed");
            }
        }
        Ok(report)
    }

    /// Drops one column. Fails with `UnsupportedOperation` where the engine
    /// has no native column drop; no table rebuild is attempted.
    pub fn drop_column(
        &self,
        conn: &mut dyn SqlConnection,
        table_name: &str,
        column: &str,
    ) -> Result<SyncReport> {
        let sql = ddl::drop_column_sql(conn.dialect(), table_name, column)?;
        let mut report = SyncReport::new(table_name, TableStatus::Altered);
        report.apply(conn, sql)?;
        Ok(report)
    }

    /// Moves column `old` to the declaration `new`. A change with no
    /// physical effect yields a report without statements.
    pub fn alter_column(
        &self,
        conn: &mut dyn SqlConnection,
        table_name: &str,
        old: &FieldSpec,
        new: &FieldSpec,
    ) -> Result<SyncReport> {
        validate_table_name(table_name)?;
        let statements = ddl::alter_column_sql(conn.dialect(), table_name, old, new)?;
        let mut report = SyncReport::new(table_name, TableStatus::Altered);
        for sql in statements {
            report.apply(conn, sql)?;
        }
        Ok(report)
    }

    pub fn drop_table_if_present(
        &self,
        conn: &mut dyn SqlConnection,
        table_name: &str,
    ) -> Result<SyncReport> {
        validate_table_name(table_name)?;
        if !conn.table_exists(table_name)? {
            return Ok(SyncReport::new(table_name, TableStatus::Absent));
        }
        let mut report = SyncReport::new(table_name, TableStatus::Dropped);
        let sql = ddl::drop_table_sql(conn.dialect(), table_name);
        report.apply(conn, sql)?;
        info!(table = table_name, "table dropped");
        Ok(report)
    }

    /// Returns the tables among `tables` that do not exist.
    pub fn verify_tables<'a, I>(&self, conn: &mut dyn SqlConnection, tables: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut missing = Vec::new();
        for table in tables {
            if !conn.table_exists(table)? {
                warn!(table, "physical table missing");
                missing.push(table.to_string());
            }
        }
        Ok(missing)
    }

    /// Creates a table whose columns are inferred from sample JSON objects.
    pub fn ensure_table_from_sample(
        &self,
        conn: &mut dyn SqlConnection,
        table_name: &str,
        sample: &[serde_json::Value],
        options: &TableOptions,
    ) -> Result<SyncReport> {
        validate_table_name(table_name)?;
        let fields = inference::infer_fields(sample)?;
        if let Some(pk) = options.primary_key.as_deref() {
            if !fields.iter().any(|f| f.name == pk) {
                return Err(DbError::Validation(format!(
                    "Primary key '{}' does not appear in the sample data for '{}'",
                    pk, table_name
                )));
            }
        }
        self.create_table_if_absent(conn, table_name, &fields, options)
    }
}
