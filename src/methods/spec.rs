use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{DbError, Result};
use crate::schema::naming::validate_identifier;

/// Template a method is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicType {
    Aggregate,
    FieldUpdate,
    CustomFunc,
}

impl LogicType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aggregate => "aggregate",
            Self::FieldUpdate => "field_update",
            Self::CustomFunc => "custom_func",
        }
    }
}

impl fmt::Display for LogicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateOp {
    Sum,
    Avg,
    Count,
    Max,
    Min,
}

impl AggregateOp {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "avg" => Ok(Self::Avg),
            "count" => Ok(Self::Count),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(DbError::UnsupportedOperation(format!(
                "aggregate operation '{}' (supported: sum, avg, count, max, min)",
                other
            ))),
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Count => "COUNT",
            Self::Max => "MAX",
            Self::Min => "MIN",
        }
    }
}

/// Parsed, typed form of a method's `params`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodLogic {
    Aggregate {
        related: String,
        field: String,
        multiply_field: Option<String>,
        op: AggregateOp,
    },
    FieldUpdate {
        field: String,
        allow_null: bool,
    },
    CustomFunc {
        path: String,
    },
}

const AGGREGATE_KEYS: &[&str] = &[
    "related",
    "related_name",
    "field",
    "agg_field",
    "aggregate_field",
    "multiply_field",
    "op",
    "operation",
];
const FIELD_UPDATE_KEYS: &[&str] = &["field", "field_name", "target_field", "allow_null"];
const CUSTOM_FUNC_KEYS: &[&str] = &["path", "func_path"];

impl MethodLogic {
    /// Checks `params` against the key schema of `logic_type`.
    pub fn parse(logic_type: LogicType, params: &serde_json::Value) -> Result<Self> {
        let empty = serde_json::Map::new();
        let object = match params {
            serde_json::Value::Object(object) => object,
            serde_json::Value::Null => &empty,
            _ => {
                return Err(DbError::Validation(format!(
                    "{} params must be a JSON object",
                    logic_type
                )));
            }
        };
        let params = Params { logic_type, object };

        match logic_type {
            LogicType::Aggregate => {
                params.reject_unknown(AGGREGATE_KEYS)?;
                let op = match params.text(&["op", "operation"])? {
                    Some(op) => AggregateOp::parse(&op)?,
                    None => AggregateOp::Sum,
                };
                let multiply_field = params.text(&["multiply_field"])?;
                if let Some(field) = &multiply_field {
                    validate_identifier("Field", field)?;
                }
                Ok(Self::Aggregate {
                    related: params.required_identifier(&["related", "related_name"])?,
                    field: params.required_identifier(&["field", "agg_field", "aggregate_field"])?,
                    multiply_field,
                    op,
                })
            }
            LogicType::FieldUpdate => {
                params.reject_unknown(FIELD_UPDATE_KEYS)?;
                let allow_null = match object.get("allow_null") {
                    None | Some(serde_json::Value::Null) => false,
                    Some(serde_json::Value::Bool(flag)) => *flag,
                    Some(_) => return Err(params.mismatch("allow_null", "a boolean")),
                };
                Ok(Self::FieldUpdate {
                    field: params.required_identifier(&["field", "target_field", "field_name"])?,
                    allow_null,
                })
            }
            LogicType::CustomFunc => {
                params.reject_unknown(CUSTOM_FUNC_KEYS)?;
                let path = params.text(&["path", "func_path"])?.ok_or_else(|| {
                    DbError::Validation("custom_func params require 'path'".into())
                })?;
                Ok(Self::CustomFunc { path })
            }
        }
    }

    pub fn logic_type(&self) -> LogicType {
        match self {
            Self::Aggregate { .. } => LogicType::Aggregate,
            Self::FieldUpdate { .. } => LogicType::FieldUpdate,
            Self::CustomFunc { .. } => LogicType::CustomFunc,
        }
    }
}

struct Params<'a> {
    logic_type: LogicType,
    object: &'a serde_json::Map<String, serde_json::Value>,
}

impl Params<'_> {
    fn reject_unknown(&self, allowed: &[&str]) -> Result<()> {
        match self.object.keys().find(|key| !allowed.contains(&key.as_str())) {
            Some(key) => Err(DbError::Validation(format!(
                "unknown {} parameter '{}'",
                self.logic_type, key
            ))),
            None => Ok(()),
        }
    }

    fn mismatch(&self, key: &str, expected: &str) -> DbError {
        DbError::Validation(format!(
            "{} parameter '{}' must be {}",
            self.logic_type, key, expected
        ))
    }

    /// First present key among `keys` (canonical name first, then aliases).
    fn text(&self, keys: &[&str]) -> Result<Option<String>> {
        for key in keys {
            match self.object.get(*key) {
                None | Some(serde_json::Value::Null) => continue,
                Some(serde_json::Value::String(text)) if !text.is_empty() => {
                    return Ok(Some(text.clone()));
                }
                Some(_) => return Err(self.mismatch(key, "a non-empty string")),
            }
        }
        Ok(None)
    }

    fn required_identifier(&self, keys: &[&str]) -> Result<String> {
        let value = self.text(keys)?.ok_or_else(|| {
            DbError::Validation(format!(
                "{} params require '{}'",
                self.logic_type, keys[0]
            ))
        })?;
        validate_identifier("Parameter", &value)?;
        Ok(value)
    }
}

fn default_active() -> bool {
    true
}

/// Authored declaration of a business method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub method_name: String,
    pub model_name: String,
    pub logic_type: LogicType,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Empty means any authenticated caller.
    #[serde(default)]
    pub allowed_roles: BTreeSet<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl MethodSpec {
    pub fn new(
        model_name: impl Into<String>,
        method_name: impl Into<String>,
        logic_type: LogicType,
        params: serde_json::Value,
    ) -> Self {
        Self {
            method_name: method_name.into(),
            model_name: model_name.into(),
            logic_type,
            params,
            allowed_roles: BTreeSet::new(),
            active: true,
        }
    }

    pub fn aggregate(model: &str, method: &str, params: serde_json::Value) -> Self {
        Self::new(model, method, LogicType::Aggregate, params)
    }

    pub fn field_update(model: &str, method: &str, params: serde_json::Value) -> Self {
        Self::new(model, method, LogicType::FieldUpdate, params)
    }

    pub fn custom_func(model: &str, method: &str, path: &str) -> Self {
        Self::new(
            model,
            method,
            LogicType::CustomFunc,
            serde_json::json!({ "path": path }),
        )
    }

    pub fn allow_role(mut self, role: impl Into<String>) -> Self {
        self.allowed_roles.insert(role.into());
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn key(&self) -> (String, String) {
        (self.model_name.clone(), self.method_name.clone())
    }

    pub fn logic(&self) -> Result<MethodLogic> {
        MethodLogic::parse(self.logic_type, &self.params)
    }

    pub fn validate(&self) -> Result<MethodLogic> {
        validate_identifier("Model", &self.model_name)?;
        validate_identifier("Method", &self.method_name)?;
        self.logic()
    }
}

/// Parses a JSON array of method definitions.
pub fn load_method_specs(json: &str) -> Result<Vec<MethodSpec>> {
    let specs: Vec<MethodSpec> = serde_json::from_str(json)?;
    for spec in &specs {
        spec.validate()?;
    }
    Ok(specs)
}
