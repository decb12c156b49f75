use std::collections::BTreeMap;

use super::Value;

/// A fetched row, columns kept in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|name| name == column)
            .map(|idx| &self.values[idx])
    }

    /// First column, for scalar queries such as aggregates.
    pub fn first(&self) -> Option<&Value> {
        self.values.first()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.columns.into_iter().zip(self.values).collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let object = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup_by_column() {
        let row = Row::new(
            vec!["id".into(), "status".into()],
            vec![Value::Integer(1), Value::Text("open".into())],
        );
        assert_eq!(row.get("status"), Some(&Value::Text("open".into())));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.first(), Some(&Value::Integer(1)));
        assert_eq!(row.to_json()["id"], serde_json::json!(1));
    }
}
