//! DDL statement rendering.
//!
//! Identifiers always go through [`Dialect::quote_ident`]. DDL cannot bind
//! parameters, so column defaults are rendered from typed [`Value`]s only,
//! with strings escaped.

use std::collections::{BTreeSet, HashMap};

use crate::core::{DbError, Result, Value};
use crate::schema::dialect::Dialect;
use crate::schema::field::{FieldKind, FieldSpec};
use crate::schema::naming::{index_name, unique_index_name};
use crate::schema::resolver::resolve;

/// Column names considered primary key candidates, in priority order.
pub const PRIMARY_KEY_CANDIDATES: &[&str] = &["id", "pk", "uid", "uuid"];

/// Column names that get a single-column index when no explicit indexes are given.
pub const INDEX_CANDIDATES: &[&str] = &[
    "status",
    "type",
    "category",
    "user_id",
    "owner_id",
    "org_id",
    "tenant_id",
    "created_at",
    "updated_at",
    "deleted_at",
    "create_time",
    "update_time",
];

/// Table-level options for CREATE TABLE.
#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    /// Column to use as primary key instead of auto-detection.
    pub primary_key: Option<String>,
    /// Explicit indexes (each a column list); disables index suggestion.
    pub indexes: Option<Vec<Vec<String>>>,
    /// Referenced table per foreign-key field name.
    pub foreign_tables: HashMap<String, String>,
}

impl TableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    pub fn index(mut self, columns: &[&str]) -> Self {
        self.indexes
            .get_or_insert_with(Vec::new)
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Disables index suggestion without declaring any index.
    pub fn no_indexes(mut self) -> Self {
        self.indexes = Some(Vec::new());
        self
    }

    pub fn foreign_table(mut self, field: impl Into<String>, table: impl Into<String>) -> Self {
        self.foreign_tables.insert(field.into(), table.into());
        self
    }
}

/// Rendered CREATE TABLE plus its follow-up index statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTablePlan {
    pub create_table: String,
    pub create_indexes: Vec<String>,
    pub primary_key: Option<String>,
}

pub fn default_literal(value: &Value, dialect: Dialect) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Float(_) => "NULL".to_string(),
        Value::Boolean(b) => match (dialect, b) {
            (Dialect::Postgres, true) => "TRUE".to_string(),
            (Dialect::Postgres, false) => "FALSE".to_string(),
            (_, true) => "1".to_string(),
            (_, false) => "0".to_string(),
        },
        Value::Text(s) => match dialect {
            // MySQL treats backslash as an escape inside string literals.
            Dialect::MySql => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''")),
            Dialect::Sqlite | Dialect::Postgres => format!("'{}'", s.replace('\'', "''")),
        },
    }
}

/// Renders one column definition.
pub fn column_definition(
    field: &FieldSpec,
    dialect: Dialect,
    foreign_table: Option<&str>,
    include_unique: bool,
) -> String {
    let column = resolve(field, dialect);
    let mut sql = format!(
        "{} {}",
        dialect.quote_ident(&field.column_name()),
        column.sql_type
    );
    if column.inline_primary_key {
        return sql;
    }

    sql.push_str(if field.nullable { " NULL" } else { " NOT NULL" });
    if include_unique && field.unique {
        sql.push_str(" UNIQUE");
    }
    if let Some(default) = &field.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default_literal(default, dialect));
    }
    if let (FieldKind::ForeignKey { on_delete, .. }, Some(table)) = (&field.kind, foreign_table) {
        sql.push_str(&format!(
            " REFERENCES {} ({}) ON DELETE {}",
            dialect.quote_ident(table),
            dialect.quote_ident("id"),
            on_delete.sql()
        ));
    }
    sql
}

/// Picks the primary key column: explicit override, an auto field, a
/// well-known candidate name, then `<table>_id`.
pub fn detect_primary_key(
    table_name: &str,
    fields: &[FieldSpec],
    explicit: Option<&str>,
) -> Result<Option<String>> {
    let auto_fields: Vec<&FieldSpec> = fields.iter().filter(|f| f.is_primary_key()).collect();
    if auto_fields.len() > 1 {
        return Err(DbError::Validation(format!(
            "Table '{}' declares more than one auto primary key",
            table_name
        )));
    }

    if let Some(column) = explicit {
        if !fields.iter().any(|f| f.column_name() == column) {
            return Err(DbError::Validation(format!(
                "Primary key column '{}' is not declared on table '{}'",
                column, table_name
            )));
        }
        if let Some(auto) = auto_fields.first().filter(|f| f.column_name() != column) {
            return Err(DbError::Validation(format!(
                "Primary key '{}' conflicts with auto primary key '{}' on table '{}'",
                column, auto.name, table_name
            )));
        }
        return Ok(Some(column.to_string()));
    }

    if let Some(auto) = auto_fields.first() {
        return Ok(Some(auto.column_name()));
    }

    let table_id = format!("{}_id", table_name);
    let mut candidates: Vec<&str> = PRIMARY_KEY_CANDIDATES.to_vec();
    candidates.push(&table_id);
    let found = candidates
        .into_iter()
        .find(|candidate| fields.iter().any(|f| f.column_name() == *candidate));
    Ok(found.map(str::to_string))
}

fn suggested_indexes(fields: &[FieldSpec], primary_key: Option<&str>) -> Vec<Vec<String>> {
    let mut seen = BTreeSet::new();
    fields
        .iter()
        .filter(|f| {
            INDEX_CANDIDATES.contains(&f.name.as_str())
                || matches!(f.kind, FieldKind::ForeignKey { .. })
        })
        .map(|f| f.column_name())
        .filter(|column| Some(column.as_str()) != primary_key)
        .filter(|column| seen.insert(column.clone()))
        .map(|column| vec![column])
        .collect()
}

fn create_index_sql(dialect: Dialect, table_name: &str, columns: &[String], unique: bool) -> String {
    let refs: Vec<&str> = columns.iter().map(String::as_str).collect();
    let quoted = columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE {}INDEX {}{} ON {} ({})",
        if unique { "UNIQUE " } else { "" },
        if dialect.supports_create_index_if_not_exists() {
            "IF NOT EXISTS "
        } else {
            ""
        },
        dialect.quote_ident(&if unique {
            unique_index_name(table_name, &refs)
        } else {
            index_name(table_name, &refs)
        }),
        dialect.quote_ident(table_name),
        quoted
    )
}

pub fn create_table_plan(
    dialect: Dialect,
    table_name: &str,
    fields: &[FieldSpec],
    options: &TableOptions,
) -> Result<CreateTablePlan> {
    if fields.is_empty() {
        return Err(DbError::Validation(format!(
            "Table '{}' must declare at least one column",
            table_name
        )));
    }
    let mut columns_seen = BTreeSet::new();
    for field in fields {
        if !columns_seen.insert(field.column_name()) {
            return Err(DbError::Validation(format!(
                "Column '{}' is declared twice on table '{}'",
                field.column_name(),
                table_name
            )));
        }
    }

    let primary_key = detect_primary_key(table_name, fields, options.primary_key.as_deref())?;

    let mut definitions: Vec<String> = fields
        .iter()
        .map(|field| {
            column_definition(
                field,
                dialect,
                options.foreign_tables.get(&field.name).map(String::as_str),
                true,
            )
        })
        .collect();

    if let Some(pk) = &primary_key {
        let inline = fields
            .iter()
            .any(|f| f.is_primary_key() && f.column_name() == *pk);
        if !inline {
            definitions.push(format!("PRIMARY KEY ({})", dialect.quote_ident(pk)));
        }
    }

    let create_table = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        dialect.quote_ident(table_name),
        definitions.join(", ")
    );

    let index_columns = match &options.indexes {
        Some(explicit) => {
            for columns in explicit {
                if columns.is_empty() {
                    return Err(DbError::Validation(format!(
                        "Empty index declared on table '{}'",
                        table_name
                    )));
                }
                if let Some(missing) = columns.iter().find(|c| !columns_seen.contains(*c)) {
                    return Err(DbError::Validation(format!(
                        "Index column '{}' is not declared on table '{}'",
                        missing, table_name
                    )));
                }
            }
            explicit.clone()
        }
        None => suggested_indexes(fields, primary_key.as_deref()),
    };

    let create_indexes = index_columns
        .iter()
        .map(|columns| create_index_sql(dialect, table_name, columns, false))
        .collect();

    Ok(CreateTablePlan {
        create_table,
        create_indexes,
        primary_key,
    })
}

/// ALTER TABLE ... ADD COLUMN. On SQLite a unique constraint becomes a
/// separate unique index, since SQLite refuses UNIQUE in ADD COLUMN.
pub fn add_column_sql(
    dialect: Dialect,
    table_name: &str,
    field: &FieldSpec,
    foreign_table: Option<&str>,
) -> Result<Vec<String>> {
    if field.is_primary_key() {
        return Err(DbError::UnsupportedOperation(format!(
            "Cannot add primary key column '{}' to existing table '{}'",
            field.name, table_name
        )));
    }
    if dialect == Dialect::Sqlite && !field.nullable && !field.has_default() {
        return Err(DbError::UnsupportedOperation(format!(
            "sqlite cannot add NOT NULL column '{}' without a default to table '{}'",
            field.name, table_name
        )));
    }

    let inline_unique = dialect != Dialect::Sqlite;
    let mut statements = vec![format!(
        "ALTER TABLE {} ADD COLUMN {}",
        dialect.quote_ident(table_name),
        column_definition(field, dialect, foreign_table, inline_unique)
    )];
    if field.unique && !inline_unique {
        statements.push(create_index_sql(
            dialect,
            table_name,
            &[field.column_name()],
            true,
        ));
    }
    Ok(statements)
}

pub fn drop_column_sql(dialect: Dialect, table_name: &str, column: &str) -> Result<String> {
    if !dialect.supports_drop_column() {
        return Err(DbError::UnsupportedOperation(format!(
            "{} does not support dropping column '{}' from table '{}'",
            dialect, column, table_name
        )));
    }
    Ok(format!(
        "ALTER TABLE {} DROP COLUMN {}",
        dialect.quote_ident(table_name),
        dialect.quote_ident(column)
    ))
}

/// Statements moving column `old` to the declaration `new` in place.
///
/// Compares the resolved column type, nullability, default and uniqueness;
/// returns no statements when only cosmetic attributes changed. Dropping a
/// unique constraint is refused on every engine, as is any physical change
/// on SQLite apart from adding a unique index.
pub fn alter_column_sql(
    dialect: Dialect,
    table_name: &str,
    old: &FieldSpec,
    new: &FieldSpec,
) -> Result<Vec<String>> {
    let table = dialect.quote_ident(table_name);
    let column = dialect.quote_ident(&new.column_name());
    let sql_type = resolve(new, dialect).sql_type;
    let type_changed = resolve(old, dialect).sql_type != sql_type;
    let null_changed = old.nullable != new.nullable;
    let default_changed = old.default != new.default;

    if old.unique && !new.unique {
        return Err(DbError::UnsupportedOperation(format!(
            "dropping the unique constraint of column '{}' on table '{}'",
            new.name, table_name
        )));
    }

    let mut statements = Vec::new();
    if type_changed || null_changed || default_changed {
        match dialect {
            Dialect::Sqlite => {
                return Err(DbError::UnsupportedOperation(format!(
                    "sqlite does not support altering column '{}' on table '{}'",
                    new.name, table_name
                )));
            }
            Dialect::Postgres => {
                if type_changed {
                    statements.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                        table, column, sql_type, column, sql_type
                    ));
                }
                if null_changed {
                    statements.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} {} NOT NULL",
                        table,
                        column,
                        if new.nullable { "DROP" } else { "SET" }
                    ));
                }
                if default_changed {
                    statements.push(match &new.default {
                        Some(value) => format!(
                            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                            table,
                            column,
                            default_literal(value, dialect)
                        ),
                        None => format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", table, column),
                    });
                }
            }
            Dialect::MySql => statements.push(format!(
                "ALTER TABLE {} MODIFY COLUMN {}",
                table,
                column_definition(new, dialect, None, false)
            )),
        }
    }
    if new.unique && !old.unique {
        statements.push(create_index_sql(
            dialect,
            table_name,
            &[new.column_name()],
            true,
        ));
    }
    Ok(statements)
}

pub fn drop_table_sql(dialect: Dialect, table_name: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", dialect.quote_ident(table_name))
}
