//! Row-level DML against a model's table.
//!
//! Keys may name a field or its physical column (`invoice` or `invoice_id`).
//! System fields are maintained here and cannot be written by callers.

use std::collections::BTreeMap;

use crate::connection::SqlConnection;
use crate::core::{DbError, Result, Row, Value};
use crate::registry::model::{RuntimeModel, is_system_field};
use crate::schema::field::FieldSpec;

pub type Values = BTreeMap<String, Value>;

/// Timestamp format written to `create_time` / `update_time`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub fn now_timestamp() -> Value {
    Value::Text(chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string())
}

fn writable_field<'a>(model: &'a RuntimeModel, key: &str) -> Result<&'a FieldSpec> {
    let field = model.field_by_column(key).ok_or_else(|| {
        DbError::Validation(format!("Model '{}' has no field '{}'", model.name(), key))
    })?;
    if is_system_field(&field.name) {
        return Err(DbError::Validation(format!(
            "Field '{}' of model '{}' is maintained by the runtime",
            field.name,
            model.name()
        )));
    }
    Ok(field)
}

/// Inserts one row and returns its id.
pub fn insert(conn: &mut dyn SqlConnection, model: &RuntimeModel, values: &Values) -> Result<i64> {
    let dialect = conn.dialect();
    let mut columns = Vec::new();
    let mut params = Vec::new();

    for (key, value) in values {
        let field = writable_field(model, key)?;
        field.check_value(value)?;
        let column = field.column_name();
        if columns.contains(&column) {
            return Err(DbError::Validation(format!(
                "Field '{}' given twice for model '{}'",
                field.name,
                model.name()
            )));
        }
        columns.push(column);
        params.push(value.clone());
    }

    if let Some(missing) = model.user_fields().find(|f| {
        f.required && !f.has_default() && !columns.contains(&f.column_name())
    }) {
        return Err(DbError::Validation(format!(
            "Field '{}' is required for model '{}'",
            missing.name,
            model.name()
        )));
    }

    let now = now_timestamp();
    columns.push("create_time".into());
    params.push(now.clone());
    columns.push("update_time".into());
    params.push(now);

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.quote_ident(model.table_name()),
        columns
            .iter()
            .map(|c| dialect.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        dialect.placeholders(1, params.len())
    );
    conn.execute(&sql, &params)?;
    conn.last_insert_id()
}

pub fn find(conn: &mut dyn SqlConnection, model: &RuntimeModel, id: i64) -> Result<Option<Row>> {
    let dialect = conn.dialect();
    let sql = format!(
        "SELECT * FROM {} WHERE {} = {}",
        dialect.quote_ident(model.table_name()),
        dialect.quote_ident("id"),
        dialect.placeholder(1)
    );
    Ok(conn.query(&sql, &[Value::Integer(id)])?.into_iter().next())
}

pub fn fetch(conn: &mut dyn SqlConnection, model: &RuntimeModel, id: i64) -> Result<Row> {
    find(conn, model, id)?.ok_or_else(|| DbError::InstanceNotFound {
        model: model.name().to_string(),
        id,
    })
}

/// Writes one field (plus `update_time`) and nothing else.
pub fn update_field(
    conn: &mut dyn SqlConnection,
    model: &RuntimeModel,
    id: i64,
    field: &FieldSpec,
    value: &Value,
) -> Result<()> {
    let dialect = conn.dialect();
    let sql = format!(
        "UPDATE {} SET {} = {}, {} = {} WHERE {} = {}",
        dialect.quote_ident(model.table_name()),
        dialect.quote_ident(&field.column_name()),
        dialect.placeholder(1),
        dialect.quote_ident("update_time"),
        dialect.placeholder(2),
        dialect.quote_ident("id"),
        dialect.placeholder(3)
    );
    let affected = conn.execute(&sql, &[value.clone(), now_timestamp(), Value::Integer(id)])?;
    if affected == 0 {
        return Err(DbError::InstanceNotFound {
            model: model.name().to_string(),
            id,
        });
    }
    Ok(())
}

/// Deletes one row; returns whether it existed.
pub fn delete(conn: &mut dyn SqlConnection, model: &RuntimeModel, id: i64) -> Result<bool> {
    let dialect = conn.dialect();
    let sql = format!(
        "DELETE FROM {} WHERE {} = {}",
        dialect.quote_ident(model.table_name()),
        dialect.quote_ident("id"),
        dialect.placeholder(1)
    );
    Ok(conn.execute(&sql, &[Value::Integer(id)])? > 0)
}

/// Rows of `child` whose foreign key `fk` points at `parent_id`.
pub fn children(
    conn: &mut dyn SqlConnection,
    child: &RuntimeModel,
    fk: &FieldSpec,
    parent_id: i64,
) -> Result<Vec<Row>> {
    let dialect = conn.dialect();
    let sql = format!(
        "SELECT * FROM {} WHERE {} = {} ORDER BY {}",
        dialect.quote_ident(child.table_name()),
        dialect.quote_ident(&fk.column_name()),
        dialect.placeholder(1),
        dialect.quote_ident("id")
    );
    conn.query(&sql, &[Value::Integer(parent_id)])
}
