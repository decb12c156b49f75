//! Field inference from sample JSON rows, for ad-hoc tables.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use super::field::{FieldKind, FieldSpec, FieldType};
use super::naming::validate_identifier;
use crate::core::{DbError, Result};

/// Infers one nullable field per key seen across `sample`.
///
/// Columns come out sorted by name. A key whose values disagree widens
/// Integer to Float and anything else to Text; nulls carry no type.
pub fn infer_fields(sample: &[JsonValue]) -> Result<Vec<FieldSpec>> {
    if sample.is_empty() {
        return Err(DbError::Validation(
            "Cannot infer a table from an empty sample".into(),
        ));
    }

    let mut observed: BTreeMap<String, Option<FieldType>> = BTreeMap::new();
    for row in sample {
        let object = row
            .as_object()
            .ok_or_else(|| DbError::Validation("Sample rows must be JSON objects".into()))?;
        for (key, value) in object {
            validate_identifier("Column", key)?;
            let slot = observed.entry(key.clone()).or_insert(None);
            if let Some(inferred) = infer_type(value) {
                *slot = Some(match *slot {
                    None => inferred,
                    Some(current) => most_general(current, inferred),
                });
            }
        }
    }

    Ok(observed
        .into_iter()
        .map(|(name, field_type)| FieldSpec::new(name, kind_for(field_type.unwrap_or(FieldType::Text))))
        .collect())
}

fn infer_type(value: &JsonValue) -> Option<FieldType> {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(_) => Some(FieldType::Boolean),
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::BigInteger),
        JsonValue::Number(_) => Some(FieldType::Float),
        JsonValue::Array(_) | JsonValue::Object(_) => Some(FieldType::Json),
        JsonValue::String(text) if looks_like_json(text) => Some(FieldType::Json),
        JsonValue::String(_) => Some(FieldType::Text),
    }
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim();
    (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<JsonValue>(trimmed).is_ok()
}

fn most_general(a: FieldType, b: FieldType) -> FieldType {
    match (a, b) {
        _ if a == b => a,
        (FieldType::BigInteger, FieldType::Float) | (FieldType::Float, FieldType::BigInteger) => {
            FieldType::Float
        }
        _ => FieldType::Text,
    }
}

fn kind_for(field_type: FieldType) -> FieldKind {
    match field_type {
        FieldType::Boolean => FieldKind::Boolean,
        FieldType::BigInteger => FieldKind::BigInteger,
        FieldType::Float => FieldKind::Float,
        FieldType::Json => FieldKind::Json,
        _ => FieldKind::Text,
    }
}
