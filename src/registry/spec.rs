use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::{DbError, Result};
use crate::schema::field::{FieldKind, FieldSpec};
use crate::schema::naming::{validate_field_name, validate_identifier, validate_table_name};

fn default_active() -> bool {
    true
}

/// Authored declaration of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Explicit table name; derived from the prefix and model name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Roles allowed to work with the model; empty means unrestricted.
    #[serde(default)]
    pub allowed_roles: BTreeSet<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: None,
            fields: Vec::new(),
            allowed_roles: BTreeSet::new(),
            active: true,
        }
    }

    pub fn table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = FieldSpec>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn allow_role(mut self, role: impl Into<String>) -> Self {
        self.allowed_roles.insert(role.into());
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(json)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validates names and field declarations. Foreign-key targets are
    /// checked later, against the registry.
    pub fn validate(&self) -> Result<()> {
        validate_fields(&self.name, &self.fields)?;
        if let Some(table) = &self.table_name {
            validate_table_name(table)?;
        }
        Ok(())
    }
}

/// Checks a model name and its user-declared fields.
pub(crate) fn validate_fields(model_name: &str, fields: &[FieldSpec]) -> Result<()> {
    validate_identifier("Model", model_name)?;

    let mut seen = HashSet::new();
    for field in fields {
        validate_field_name(&field.name)?;
        field.validate()?;
        if !seen.insert(field.name.as_str()) {
            return Err(DbError::Validation(format!(
                "Model '{}' declares field '{}' twice",
                model_name, field.name
            )));
        }
        match &field.kind {
            FieldKind::Auto => {
                return Err(DbError::Validation(format!(
                    "Model '{}': field '{}' cannot be an auto primary key; 'id' is provided",
                    model_name, field.name
                )));
            }
            FieldKind::ForeignKey { to, .. } => validate_identifier("Foreign key target", to)?,
            _ => {}
        }
    }

    // foreign keys occupy `<name>_id`, which must not shadow another field
    for field in fields {
        if matches!(field.kind, FieldKind::ForeignKey { .. }) {
            let column = field.column_name();
            if seen.contains(column.as_str()) {
                return Err(DbError::Validation(format!(
                    "Model '{}': foreign key '{}' collides with field '{}'",
                    model_name, field.name, column
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::FieldKind;

    #[test]
    fn test_parse_from_json() {
        let spec = ModelSpec::from_json_str(
            r#"{
                "name": "Invoice",
                "fields": [
                    {"name": "total", "type": "decimal", "max_digits": 10, "decimal_places": 2},
                    {"name": "status", "type": "string", "max_length": 20, "required": true}
                ],
                "allowed_roles": ["accounting"]
            }"#,
        )
        .unwrap();

        assert_eq!(spec.name, "Invoice");
        assert!(spec.active);
        assert_eq!(spec.fields.len(), 2);
        assert!(!spec.field_named("status").unwrap().nullable);
        assert!(spec.allowed_roles.contains("accounting"));
    }

    #[test]
    fn test_rejects_reserved_and_duplicate_fields() {
        let reserved = ModelSpec::new("Invoice").field(FieldSpec::new("create_time", FieldKind::DateTime));
        assert!(matches!(reserved.validate(), Err(DbError::Validation(_))));

        let duplicate = ModelSpec::new("Invoice")
            .field(FieldSpec::new("total", FieldKind::Float))
            .field(FieldSpec::new("total", FieldKind::Integer));
        assert!(duplicate.validate().is_err());
    }

    #[test]
    fn test_rejects_foreign_key_column_collision() {
        let spec = ModelSpec::new("Line")
            .field(FieldSpec::new("invoice", FieldKind::foreign_key("Invoice")))
            .field(FieldSpec::new("invoice_id", FieldKind::Integer));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let err = ModelSpec::from_json_str(
            r#"{"name": "Blob", "fields": [{"name": "data", "type": "hologram"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("hologram"));
    }
}
