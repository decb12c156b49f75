//! Field type resolution per dialect.
//!
//! This is the only place that knows how a logical field type is spelled in
//! each vendor's DDL. It is pure: no I/O, no shared state.

use crate::schema::dialect::Dialect;
use crate::schema::field::{FieldKind, FieldSpec};

/// Concrete column type for one field on one dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    /// Type as written in DDL, e.g. `VARCHAR(20)` or `NUMERIC(10, 2)`.
    pub sql_type: String,
    /// The type already declares the column as an auto-increment primary key.
    pub inline_primary_key: bool,
}

impl ColumnType {
    fn plain(sql_type: impl Into<String>) -> Self {
        Self {
            sql_type: sql_type.into(),
            inline_primary_key: false,
        }
    }
}

pub fn resolve(field: &FieldSpec, dialect: Dialect) -> ColumnType {
    resolve_kind(&field.kind, dialect)
}

pub fn resolve_kind(kind: &FieldKind, dialect: Dialect) -> ColumnType {
    use Dialect::*;

    match kind {
        FieldKind::Auto => ColumnType {
            sql_type: match dialect {
                Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
                Postgres => "BIGSERIAL PRIMARY KEY",
                MySql => "BIGINT AUTO_INCREMENT PRIMARY KEY",
            }
            .to_string(),
            inline_primary_key: true,
        },
        FieldKind::Char { max_length }
        | FieldKind::Email { max_length }
        | FieldKind::Url { max_length } => ColumnType::plain(format!("VARCHAR({})", max_length)),
        FieldKind::Text => ColumnType::plain("TEXT"),
        FieldKind::Integer => ColumnType::plain(match dialect {
            MySql => "INT",
            Sqlite | Postgres => "INTEGER",
        }),
        FieldKind::BigInteger | FieldKind::ForeignKey { .. } => ColumnType::plain("BIGINT"),
        FieldKind::SmallInteger => ColumnType::plain("SMALLINT"),
        FieldKind::Float => ColumnType::plain(match dialect {
            Sqlite => "REAL",
            Postgres => "DOUBLE PRECISION",
            MySql => "DOUBLE",
        }),
        FieldKind::Decimal {
            max_digits,
            decimal_places,
        } => ColumnType::plain(match dialect {
            Postgres => format!("NUMERIC({}, {})", max_digits, decimal_places),
            Sqlite | MySql => format!("DECIMAL({}, {})", max_digits, decimal_places),
        }),
        FieldKind::Boolean => ColumnType::plain(match dialect {
            Postgres => "BOOLEAN",
            MySql => "TINYINT(1)",
            Sqlite => "INTEGER",
        }),
        FieldKind::Date => ColumnType::plain("DATE"),
        FieldKind::DateTime => ColumnType::plain(match dialect {
            Postgres => "TIMESTAMP",
            Sqlite | MySql => "DATETIME",
        }),
        FieldKind::Time => ColumnType::plain("TIME"),
        FieldKind::Json => ColumnType::plain(match dialect {
            Postgres => "JSONB",
            MySql => "JSON",
            Sqlite => "TEXT",
        }),
        FieldKind::Uuid => ColumnType::plain(match dialect {
            Postgres => "UUID",
            MySql => "CHAR(36)",
            Sqlite => "TEXT",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boolean_quirk_isolated_per_dialect() {
        let flag = FieldSpec::new("paid", FieldKind::Boolean);
        assert_eq!(resolve(&flag, Dialect::Postgres).sql_type, "BOOLEAN");
        assert_eq!(resolve(&flag, Dialect::MySql).sql_type, "TINYINT(1)");
        assert_eq!(resolve(&flag, Dialect::Sqlite).sql_type, "INTEGER");
    }

    #[test]
    fn test_decimal_precision_syntax() {
        let total = FieldSpec::new("total", FieldKind::decimal(10, 2));
        assert_eq!(resolve(&total, Dialect::Postgres).sql_type, "NUMERIC(10, 2)");
        assert_eq!(resolve(&total, Dialect::MySql).sql_type, "DECIMAL(10, 2)");
    }

    #[test]
    fn test_auto_declares_inline_primary_key() {
        let id = FieldSpec::new("id", FieldKind::Auto);
        for dialect in [Dialect::Sqlite, Dialect::Postgres, Dialect::MySql] {
            let column = resolve(&id, dialect);
            assert!(column.inline_primary_key);
            assert!(column.sql_type.contains("PRIMARY KEY"));
        }
    }

    #[test]
    fn test_string_lengths() {
        let status = FieldSpec::new("status", FieldKind::char(20));
        assert_eq!(resolve(&status, Dialect::Sqlite).sql_type, "VARCHAR(20)");
        let email = FieldSpec::new("email", FieldKind::Email { max_length: 254 });
        assert_eq!(resolve(&email, Dialect::MySql).sql_type, "VARCHAR(254)");
    }
}
