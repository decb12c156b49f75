//! Bodies of the three method templates.

use super::context::{MethodArgs, MethodContext};
use super::functions::FunctionRegistry;
use super::spec::{AggregateOp, MethodLogic};
use crate::core::{DbError, Result, Value};
use crate::records;
use crate::registry::model::{RuntimeModel, is_system_field};
use crate::schema::field::{FieldSpec, FieldType};

pub(crate) fn execute(
    logic: &MethodLogic,
    ctx: &mut MethodContext<'_>,
    args: &MethodArgs,
    functions: &FunctionRegistry,
) -> Result<Value> {
    match logic {
        MethodLogic::Aggregate {
            related,
            field,
            multiply_field,
            op,
        } => aggregate(ctx, related, field, multiply_field.as_deref(), *op),
        MethodLogic::FieldUpdate { field, allow_null } => field_update(ctx, field, *allow_null, args),
        MethodLogic::CustomFunc { path } => custom_func(ctx, path, args, functions),
    }
}

fn numeric_column<'a>(child: &'a RuntimeModel, name: &str, op: AggregateOp) -> Result<&'a FieldSpec> {
    let field = child.field_by_column(name).ok_or_else(|| {
        DbError::Validation(format!("Model '{}' has no field '{}'", child.name(), name))
    })?;
    let numeric = matches!(
        field.field_type(),
        FieldType::Integer
            | FieldType::BigInteger
            | FieldType::SmallInteger
            | FieldType::Float
            | FieldType::Decimal
    );
    if !numeric && op != AggregateOp::Count {
        return Err(DbError::Validation(format!(
            "Field '{}' of model '{}' is not numeric and cannot be aggregated with {}",
            field.name,
            child.name(),
            op.sql()
        )));
    }
    Ok(field)
}

/// Reduces the related rows of the instance; an empty set yields 0.
fn aggregate(
    ctx: &mut MethodContext<'_>,
    related: &str,
    field: &str,
    multiply_field: Option<&str>,
    op: AggregateOp,
) -> Result<Value> {
    ctx.instance()?;
    let (child, fk) = ctx
        .registry
        .find_relation(ctx.model.name(), related)
        .ok_or_else(|| DbError::UnknownRelation {
            model: ctx.model.name().to_string(),
            related: related.to_string(),
        })?;

    let dialect = ctx.conn.dialect();
    let mut expr = dialect.quote_ident(&numeric_column(&child, field, op)?.column_name());
    if let Some(multiplier) = multiply_field {
        let multiplier = numeric_column(&child, multiplier, op)?;
        expr = format!("{} * {}", expr, dialect.quote_ident(&multiplier.column_name()));
    }

    let sql = format!(
        "SELECT {}({}) AS {} FROM {} WHERE {} = {}",
        op.sql(),
        expr,
        dialect.quote_ident("value"),
        dialect.quote_ident(child.table_name()),
        dialect.quote_ident(&fk.column_name()),
        dialect.placeholder(1)
    );
    let rows = ctx.conn.query(&sql, &[Value::Integer(ctx.instance_id)])?;
    let value = rows
        .into_iter()
        .next()
        .and_then(|row| row.first().cloned())
        .unwrap_or(Value::Null);

    Ok(match value {
        Value::Null => Value::Integer(0),
        other => other,
    })
}

/// Sets one field from the argument of the same name (or the first
/// positional argument) and writes only that column.
fn field_update(
    ctx: &mut MethodContext<'_>,
    field_name: &str,
    allow_null: bool,
    args: &MethodArgs,
) -> Result<Value> {
    let field = ctx
        .model
        .field_by_column(field_name)
        .cloned()
        .ok_or_else(|| {
            DbError::Validation(format!(
                "Model '{}' has no field '{}'",
                ctx.model.name(),
                field_name
            ))
        })?;
    if is_system_field(&field.name) {
        return Err(DbError::Validation(format!(
            "Field '{}' is maintained by the runtime and cannot be updated",
            field.name
        )));
    }

    let value = args.value_for(field_name).cloned().unwrap_or(Value::Null);
    if value.is_null() && !allow_null {
        return Err(DbError::Validation(format!(
            "Field '{}' cannot be set to null (allow_null is false)",
            field.name
        )));
    }
    field.check_value(&value)?;

    let model = ctx.model.clone();
    records::update_field(&mut *ctx.conn, &model, ctx.instance_id, &field, &value)?;
    let row = ctx.instance()?;
    Ok(row.get(&field.column_name()).cloned().unwrap_or(Value::Null))
}

fn custom_func(
    ctx: &mut MethodContext<'_>,
    path: &str,
    args: &MethodArgs,
    functions: &FunctionRegistry,
) -> Result<Value> {
    let function = functions.resolve(path)?;
    function(ctx, args).map_err(|err| match err.downcast::<DbError>() {
        Ok(db_err) => db_err,
        Err(other) => DbError::FunctionFailed {
            path: path.to_string(),
            message: format!("{:#}", other),
        },
    })
}
