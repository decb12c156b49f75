use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::schema::field::{FieldKind, FieldSpec};

/// Columns every runtime model carries.
pub const SYSTEM_FIELD_NAMES: &[&str] = &["id", "create_time", "update_time"];

pub fn system_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("id", FieldKind::Auto).nullable(false),
        FieldSpec::new("create_time", FieldKind::DateTime),
        FieldSpec::new("update_time", FieldKind::DateTime),
    ]
}

pub fn is_system_field(name: &str) -> bool {
    SYSTEM_FIELD_NAMES.contains(&name)
}

/// Content hash identifying a built model.
///
/// Fields are sorted by name and reduced to their typed configuration, so
/// declaration order and cosmetic labels do not change the key.
pub fn cache_key(model_name: &str, table_name: &str, fields: &[FieldSpec]) -> String {
    let mut sorted: Vec<&FieldSpec> = fields.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let canonical: Vec<serde_json::Value> = sorted
        .into_iter()
        .map(|field| {
            let mut json = field.to_json();
            if let Some(object) = json.as_object_mut() {
                object.remove("label");
                object.remove("help_text");
            }
            json
        })
        .collect();

    let material = format!(
        "{}|{}|{}",
        model_name,
        table_name,
        serde_json::Value::Array(canonical)
    );
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// A constructed model bound to its physical table.
///
/// Handles are immutable and shared through `Arc`; an update produces a new
/// handle rather than mutating this one.
#[derive(Debug, Clone)]
pub struct RuntimeModel {
    name: String,
    table_name: String,
    fields: Vec<FieldSpec>,
    cache_key: String,
    built_at: DateTime<Utc>,
}

impl RuntimeModel {
    pub(crate) fn build(name: &str, table_name: &str, user_fields: &[FieldSpec], cache_key: String) -> Self {
        let mut fields = system_fields();
        fields.extend(user_fields.iter().cloned());
        Self {
            name: name.to_string(),
            table_name: table_name.to_string(),
            fields,
            cache_key,
            built_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// System fields followed by declared fields.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn user_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| !is_system_field(&f.name))
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Finds a field by declared name or by physical column name.
    pub fn field_by_column(&self, column: &str) -> Option<&FieldSpec> {
        self.field(column)
            .or_else(|| self.fields.iter().find(|f| f.column_name() == column))
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Foreign-key fields with their target model name.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&FieldSpec, &str)> {
        self.fields.iter().filter_map(|f| match &f.kind {
            FieldKind::ForeignKey { to, .. } => Some((f, to.as_str())),
            _ => None,
        })
    }

    /// Name under which the target model sees rows of this model through `fk`.
    pub fn related_name(&self, fk: &FieldSpec) -> Option<String> {
        match &fk.kind {
            FieldKind::ForeignKey { related_name, .. } => Some(
                related_name
                    .clone()
                    .unwrap_or_else(|| format!("{}_set", self.name.to_lowercase())),
            ),
            _ => None,
        }
    }

    /// Physical columns in declaration order.
    pub fn columns(&self) -> Vec<String> {
        self.fields.iter().map(FieldSpec::column_name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_ignores_order_and_labels() {
        let a = vec![
            FieldSpec::new("total", FieldKind::decimal(10, 2)).label("Total"),
            FieldSpec::new("status", FieldKind::char(20)),
        ];
        let b = vec![
            FieldSpec::new("status", FieldKind::char(20)),
            FieldSpec::new("total", FieldKind::decimal(10, 2)),
        ];
        assert_eq!(cache_key("Invoice", "t", &a), cache_key("Invoice", "t", &b));
        assert_ne!(cache_key("Invoice", "t", &a), cache_key("Invoice", "t2", &a));

        let widened = vec![
            FieldSpec::new("status", FieldKind::char(40)),
            FieldSpec::new("total", FieldKind::decimal(10, 2)),
        ];
        assert_ne!(cache_key("Invoice", "t", &a), cache_key("Invoice", "t", &widened));
    }

    #[test]
    fn test_handle_layout_and_relations() {
        let line = RuntimeModel::build(
            "InvoiceLine",
            "lowcode_invoiceline",
            &[
                FieldSpec::new("invoice", FieldKind::foreign_key("Invoice")),
                FieldSpec::new("amount", FieldKind::Float),
            ],
            "k".into(),
        );

        assert_eq!(
            line.columns(),
            vec!["id", "create_time", "update_time", "invoice_id", "amount"]
        );
        assert_eq!(line.user_fields().count(), 2);
        let (fk, target) = line.foreign_keys().next().unwrap();
        assert_eq!(target, "Invoice");
        assert_eq!(line.related_name(fk).as_deref(), Some("invoiceline_set"));
        assert_eq!(line.field_by_column("invoice_id").unwrap().name, "invoice");
    }
}
