use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::DbError;

/// SQL dialect of the database being driven.
///
/// Everything that differs between vendors (quoting, placeholders, which DDL
/// is available, catalog queries) is answered here so callers never branch
/// on the vendor themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        }
    }

    /// Quotes an identifier, doubling any embedded quote character.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
            Self::Sqlite | Self::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Bind placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${}", index),
            Self::Sqlite | Self::MySql => "?".to_string(),
        }
    }

    /// Comma-separated placeholders for `count` parameters starting at `start`.
    pub fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|idx| self.placeholder(idx))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn supports_drop_column(&self) -> bool {
        !matches!(self, Self::Sqlite)
    }

    pub fn supports_alter_column_type(&self) -> bool {
        !matches!(self, Self::Sqlite)
    }

    pub fn supports_create_index_if_not_exists(&self) -> bool {
        !matches!(self, Self::MySql)
    }

    /// Query returning one row when the table named by parameter 1 exists.
    pub fn table_exists_sql(&self) -> String {
        match self {
            Self::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?".to_string()
            }
            Self::Postgres => "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
                .to_string(),
            Self::MySql => "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?"
                .to_string(),
        }
    }

    /// Query listing column names of the table named by parameter 1.
    pub fn column_names_sql(&self) -> String {
        match self {
            Self::Sqlite => "SELECT name FROM pragma_table_info(?) ORDER BY cid".to_string(),
            Self::Postgres => "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position"
                .to_string(),
            Self::MySql => "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 ORDER BY ordinal_position"
                .to_string(),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(DbError::UnsupportedOperation(format!(
                "Unknown SQL dialect '{}'",
                other
            ))),
        }
    }
}
