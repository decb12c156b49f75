//! Typed field declarations.
//!
//! A field is a closed variant per logical type carrying only the parameters
//! that type understands. Declarations authored as JSON go through
//! [`FieldSpec::from_json`], which rejects unknown types and unknown
//! parameters instead of passing arbitrary keyword bags along.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{DbError, Result, Value};
use crate::schema::naming::validate_identifier;

/// Length used for `char` fields declared without `max_length`.
pub const DEFAULT_CHAR_LENGTH: u32 = 255;
/// Length used for `email` fields declared without `max_length`.
pub const DEFAULT_EMAIL_LENGTH: u32 = 254;
/// Length used for `url` fields declared without `max_length`.
pub const DEFAULT_URL_LENGTH: u32 = 200;
pub const DEFAULT_DECIMAL_DIGITS: u8 = 10;
pub const DEFAULT_DECIMAL_PLACES: u8 = 2;
/// Largest precision every supported engine accepts.
pub const MAX_DECIMAL_DIGITS: u8 = 65;

const COMMON_KEYS: &[&str] = &[
    "name",
    "type",
    "label",
    "help_text",
    "required",
    "nullable",
    "null",
    "default",
    "unique",
];
const LENGTH_KEYS: &[&str] = &["max_length"];
const DECIMAL_KEYS: &[&str] = &["max_digits", "precision", "decimal_places", "scale"];
const FOREIGN_KEY_KEYS: &[&str] = &["to", "on_delete", "related_name"];

/// Logical type tag, without parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Auto,
    Char,
    Text,
    Integer,
    BigInteger,
    SmallInteger,
    Float,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Time,
    Email,
    Url,
    Json,
    Uuid,
    ForeignKey,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Char => "char",
            Self::Text => "text",
            Self::Integer => "integer",
            Self::BigInteger => "big_integer",
            Self::SmallInteger => "small_integer",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Time => "time",
            Self::Email => "email",
            Self::Url => "url",
            Self::Json => "json",
            Self::Uuid => "uuid",
            Self::ForeignKey => "foreign_key",
        }
    }

    /// Resolves a type name or alias (`string`, `int`, `BooleanField`, ...).
    pub fn parse(name: &str) -> Option<Self> {
        let mut normalized = name.to_ascii_lowercase().replace('_', "");
        if normalized.len() > "field".len() && normalized.ends_with("field") {
            normalized.truncate(normalized.len() - "field".len());
        }
        let parsed = match normalized.as_str() {
            "auto" | "serial" => Self::Auto,
            "char" | "string" | "varchar" => Self::Char,
            "text" => Self::Text,
            "int" | "integer" => Self::Integer,
            "bigint" | "biginteger" => Self::BigInteger,
            "smallint" | "smallinteger" => Self::SmallInteger,
            "float" | "double" | "real" => Self::Float,
            "decimal" | "numeric" => Self::Decimal,
            "bool" | "boolean" => Self::Boolean,
            "date" => Self::Date,
            "datetime" | "timestamp" => Self::DateTime,
            "time" => Self::Time,
            "email" => Self::Email,
            "url" => Self::Url,
            "json" => Self::Json,
            "uuid" => Self::Uuid,
            "foreignkey" | "fk" => Self::ForeignKey,
            _ => return None,
        };
        Some(parsed)
    }

    fn extra_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Char | Self::Email | Self::Url => LENGTH_KEYS,
            Self::Decimal => DECIMAL_KEYS,
            Self::ForeignKey => FOREIGN_KEY_KEYS,
            _ => &[],
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Referential action for foreign keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OnDelete {
    #[default]
    Cascade,
    SetNull,
    Restrict,
    NoAction,
}

impl OnDelete {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().replace(' ', "_").as_str() {
            "CASCADE" => Some(Self::Cascade),
            "SET_NULL" => Some(Self::SetNull),
            "RESTRICT" | "PROTECT" => Some(Self::Restrict),
            "NO_ACTION" | "DO_NOTHING" => Some(Self::NoAction),
            _ => None,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::Restrict => "RESTRICT",
            Self::NoAction => "NO ACTION",
        }
    }
}

/// Logical type plus the parameters valid for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Auto-incrementing integer primary key.
    Auto,
    Char { max_length: u32 },
    Text,
    Integer,
    BigInteger,
    SmallInteger,
    Float,
    Decimal { max_digits: u8, decimal_places: u8 },
    Boolean,
    Date,
    DateTime,
    Time,
    Email { max_length: u32 },
    Url { max_length: u32 },
    Json,
    Uuid,
    ForeignKey {
        to: String,
        on_delete: OnDelete,
        related_name: Option<String>,
    },
}

impl FieldKind {
    pub fn char(max_length: u32) -> Self {
        Self::Char { max_length }
    }

    pub fn decimal(max_digits: u8, decimal_places: u8) -> Self {
        Self::Decimal {
            max_digits,
            decimal_places,
        }
    }

    pub fn foreign_key(to: impl Into<String>) -> Self {
        Self::ForeignKey {
            to: to.into(),
            on_delete: OnDelete::Cascade,
            related_name: None,
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Auto => FieldType::Auto,
            Self::Char { .. } => FieldType::Char,
            Self::Text => FieldType::Text,
            Self::Integer => FieldType::Integer,
            Self::BigInteger => FieldType::BigInteger,
            Self::SmallInteger => FieldType::SmallInteger,
            Self::Float => FieldType::Float,
            Self::Decimal { .. } => FieldType::Decimal,
            Self::Boolean => FieldType::Boolean,
            Self::Date => FieldType::Date,
            Self::DateTime => FieldType::DateTime,
            Self::Time => FieldType::Time,
            Self::Email { .. } => FieldType::Email,
            Self::Url { .. } => FieldType::Url,
            Self::Json => FieldType::Json,
            Self::Uuid => FieldType::Uuid,
            Self::ForeignKey { .. } => FieldType::ForeignKey,
        }
    }

    fn max_length(&self) -> Option<u32> {
        match self {
            Self::Char { max_length } | Self::Email { max_length } | Self::Url { max_length } => {
                Some(*max_length)
            }
            _ => None,
        }
    }
}

/// A declared field of a runtime model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub nullable: bool,
    pub default: Option<Value>,
    pub unique: bool,
    pub label: Option<String>,
    pub help_text: Option<String>,
}

impl FieldSpec {
    /// Optional, nullable field with no default.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            nullable: true,
            default: None,
            unique: false,
            label: None,
            help_text: None,
        }
    }

    /// Marks the field required, which also makes it NOT NULL.
    pub fn required(mut self) -> Self {
        self.required = true;
        self.nullable = false;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn field_type(&self) -> FieldType {
        self.kind.field_type()
    }

    /// Physical column name; foreign keys are stored as `<name>_id`.
    pub fn column_name(&self) -> String {
        match self.kind {
            FieldKind::ForeignKey { .. } => format!("{}_id", self.name),
            _ => self.name.clone(),
        }
    }

    pub fn is_primary_key(&self) -> bool {
        matches!(self.kind, FieldKind::Auto)
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Checks parameter consistency for this field.
    pub fn validate(&self) -> Result<()> {
        validate_identifier("Field", &self.name)?;
        match &self.kind {
            FieldKind::Char { max_length }
            | FieldKind::Email { max_length }
            | FieldKind::Url { max_length } => {
                if *max_length == 0 {
                    return Err(self.invalid("max_length must be greater than 0"));
                }
            }
            FieldKind::Decimal {
                max_digits,
                decimal_places,
            } => {
                if *max_digits == 0 || *max_digits > MAX_DECIMAL_DIGITS {
                    return Err(self.invalid(&format!(
                        "max_digits must be between 1 and {}",
                        MAX_DECIMAL_DIGITS
                    )));
                }
                if decimal_places > max_digits {
                    return Err(self.invalid("decimal_places cannot exceed max_digits"));
                }
            }
            FieldKind::ForeignKey {
                to,
                on_delete,
                related_name,
            } => {
                validate_identifier("Foreign key target", to)?;
                if let Some(related) = related_name {
                    validate_identifier("Related name", related)?;
                }
                if *on_delete == OnDelete::SetNull && !self.nullable {
                    return Err(self.invalid("on_delete SET NULL requires a nullable field"));
                }
            }
            _ => {}
        }
        if let Some(default) = &self.default {
            self.check_value(default)?;
        }
        Ok(())
    }

    /// Checks that `value` may be stored in this field.
    pub fn check_value(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if self.nullable || self.is_primary_key() {
                return Ok(());
            }
            return Err(self.invalid("value cannot be null"));
        }

        let accepted = match &self.kind {
            FieldKind::Auto
            | FieldKind::Integer
            | FieldKind::BigInteger
            | FieldKind::SmallInteger
            | FieldKind::ForeignKey { .. } => matches!(value, Value::Integer(_)),
            FieldKind::Float | FieldKind::Decimal { .. } => value.is_numeric(),
            FieldKind::Boolean => matches!(value, Value::Boolean(_) | Value::Integer(0 | 1)),
            FieldKind::Char { .. } | FieldKind::Email { .. } | FieldKind::Url { .. } => {
                match value.as_str() {
                    Some(text) => {
                        let limit = self.kind.max_length().unwrap_or(u32::MAX) as usize;
                        if text.chars().count() > limit {
                            return Err(self.invalid(&format!(
                                "value exceeds max_length {}",
                                limit
                            )));
                        }
                        true
                    }
                    None => false,
                }
            }
            FieldKind::Text => value.as_str().is_some(),
            FieldKind::Date => value
                .as_str()
                .is_some_and(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()),
            FieldKind::DateTime => value.as_str().is_some_and(is_datetime_text),
            FieldKind::Time => value
                .as_str()
                .is_some_and(|s| chrono::NaiveTime::parse_from_str(s, "%H:%M:%S").is_ok()),
            FieldKind::Json => value
                .as_str()
                .is_some_and(|s| serde_json::from_str::<serde_json::Value>(s).is_ok()),
            FieldKind::Uuid => value
                .as_str()
                .is_some_and(|s| uuid::Uuid::parse_str(s).is_ok()),
        };

        if accepted {
            Ok(())
        } else {
            Err(self.invalid(&format!(
                "{} value '{}' is not valid for type '{}'",
                value.type_name(),
                value,
                self.field_type()
            )))
        }
    }

    fn invalid(&self, message: &str) -> DbError {
        DbError::Validation(format!("Field '{}': {}", self.name, message))
    }

    /// Parses an authored field declaration.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let object = json
            .as_object()
            .ok_or_else(|| DbError::Validation("Field declaration must be a JSON object".into()))?;

        let name = object
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DbError::Validation("Field declaration requires a 'name'".into()))?
            .to_string();
        let type_name = object
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DbError::Validation(format!("Field '{}' requires a 'type'", name))
            })?;
        let field_type =
            FieldType::parse(type_name).ok_or_else(|| DbError::UnsupportedFieldType {
                field: name.clone(),
                type_name: type_name.to_string(),
            })?;

        let extra = field_type.extra_keys();
        for key in object.keys() {
            if !COMMON_KEYS.contains(&key.as_str()) && !extra.contains(&key.as_str()) {
                return Err(DbError::Validation(format!(
                    "Field '{}': unknown parameter '{}' for type '{}'",
                    name, key, field_type
                )));
            }
        }

        let params = JsonParams {
            field: &name,
            object,
        };
        let kind = match field_type {
            FieldType::Auto => FieldKind::Auto,
            FieldType::Char => FieldKind::Char {
                max_length: params.u32_or("max_length", DEFAULT_CHAR_LENGTH)?,
            },
            FieldType::Email => FieldKind::Email {
                max_length: params.u32_or("max_length", DEFAULT_EMAIL_LENGTH)?,
            },
            FieldType::Url => FieldKind::Url {
                max_length: params.u32_or("max_length", DEFAULT_URL_LENGTH)?,
            },
            FieldType::Text => FieldKind::Text,
            FieldType::Integer => FieldKind::Integer,
            FieldType::BigInteger => FieldKind::BigInteger,
            FieldType::SmallInteger => FieldKind::SmallInteger,
            FieldType::Float => FieldKind::Float,
            FieldType::Decimal => FieldKind::Decimal {
                max_digits: params.u8_alias_or(&["max_digits", "precision"], DEFAULT_DECIMAL_DIGITS)?,
                decimal_places: params
                    .u8_alias_or(&["decimal_places", "scale"], DEFAULT_DECIMAL_PLACES)?,
            },
            FieldType::Boolean => FieldKind::Boolean,
            FieldType::Date => FieldKind::Date,
            FieldType::DateTime => FieldKind::DateTime,
            FieldType::Time => FieldKind::Time,
            FieldType::Json => FieldKind::Json,
            FieldType::Uuid => FieldKind::Uuid,
            FieldType::ForeignKey => {
                let to = params.string("to")?.ok_or_else(|| {
                    DbError::Validation(format!("Field '{}': foreign key requires 'to'", name))
                })?;
                let on_delete = match params.string("on_delete")? {
                    Some(raw) => OnDelete::parse(&raw).ok_or_else(|| {
                        DbError::Validation(format!(
                            "Field '{}': unknown on_delete action '{}'",
                            name, raw
                        ))
                    })?,
                    None => OnDelete::default(),
                };
                FieldKind::ForeignKey {
                    to,
                    on_delete,
                    related_name: params.string("related_name")?,
                }
            }
        };

        let required = params.bool("required")?.unwrap_or(false);
        let nullable = match params.bool("nullable")? {
            Some(flag) => Some(flag),
            None => params.bool("null")?,
        }
        .unwrap_or(!required);

        let spec = Self {
            default: object
                .get("default")
                .filter(|v| !v.is_null())
                .map(Value::from_json),
            unique: params.bool("unique")?.unwrap_or(false),
            label: params.string("label")?,
            help_text: params.string("help_text")?,
            name,
            kind,
            required,
            nullable,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Canonical JSON form; keys come out sorted.
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert("name".into(), self.name.clone().into());
        object.insert("type".into(), self.field_type().name().into());
        object.insert("required".into(), self.required.into());
        object.insert("nullable".into(), self.nullable.into());
        if self.unique {
            object.insert("unique".into(), true.into());
        }
        if let Some(default) = &self.default {
            object.insert("default".into(), default.to_json());
        }
        if let Some(label) = &self.label {
            object.insert("label".into(), label.clone().into());
        }
        if let Some(help_text) = &self.help_text {
            object.insert("help_text".into(), help_text.clone().into());
        }
        match &self.kind {
            FieldKind::Char { max_length }
            | FieldKind::Email { max_length }
            | FieldKind::Url { max_length } => {
                object.insert("max_length".into(), (*max_length).into());
            }
            FieldKind::Decimal {
                max_digits,
                decimal_places,
            } => {
                object.insert("max_digits".into(), (*max_digits).into());
                object.insert("decimal_places".into(), (*decimal_places).into());
            }
            FieldKind::ForeignKey {
                to,
                on_delete,
                related_name,
            } => {
                object.insert("to".into(), to.clone().into());
                object.insert("on_delete".into(), on_delete.sql().into());
                if let Some(related) = related_name {
                    object.insert("related_name".into(), related.clone().into());
                }
            }
            _ => {}
        }
        serde_json::Value::Object(object)
    }
}

impl TryFrom<serde_json::Value> for FieldSpec {
    type Error = DbError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        Self::from_json(&value)
    }
}

impl From<FieldSpec> for serde_json::Value {
    fn from(spec: FieldSpec) -> Self {
        spec.to_json()
    }
}

fn is_datetime_text(text: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(text).is_ok()
        || chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").is_ok()
        || chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").is_ok()
}

/// Typed accessors over a declaration object.
struct JsonParams<'a> {
    field: &'a str,
    object: &'a serde_json::Map<String, serde_json::Value>,
}

impl JsonParams<'_> {
    fn mismatch(&self, key: &str, expected: &str) -> DbError {
        DbError::Validation(format!(
            "Field '{}': parameter '{}' must be {}",
            self.field, key, expected
        ))
    }

    fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.object.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => v.as_bool().map(Some).ok_or_else(|| self.mismatch(key, "a boolean")),
        }
    }

    fn string(&self, key: &str) -> Result<Option<String>> {
        match self.object.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| self.mismatch(key, "a string")),
        }
    }

    fn u32_or(&self, key: &str, default: u32) -> Result<u32> {
        match self.object.get(key) {
            None | Some(serde_json::Value::Null) => Ok(default),
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| self.mismatch(key, "a positive integer")),
        }
    }

    fn u8_alias_or(&self, keys: &[&str], default: u8) -> Result<u8> {
        for key in keys {
            if let Some(v) = self.object.get(*key).filter(|v| !v.is_null()) {
                return v
                    .as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| self.mismatch(key, "a small positive integer"));
            }
        }
        Ok(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_char_gets_documented_default_length() {
        let spec = FieldSpec::from_json(&json!({"name": "title", "type": "string"})).unwrap();
        assert_eq!(spec.kind, FieldKind::Char { max_length: DEFAULT_CHAR_LENGTH });
        assert!(spec.nullable);
        assert!(!spec.required);
    }

    #[test]
    fn test_type_aliases() {
        assert_eq!(FieldType::parse("BooleanField"), Some(FieldType::Boolean));
        assert_eq!(FieldType::parse("big_integer"), Some(FieldType::BigInteger));
        assert_eq!(FieldType::parse("fk"), Some(FieldType::ForeignKey));
        assert_eq!(FieldType::parse("geometry"), None);
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let err = FieldSpec::from_json(&json!({"name": "shape", "type": "polygon"})).unwrap_err();
        assert!(matches!(err, DbError::UnsupportedFieldType { ref field, .. } if field == "shape"));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let err = FieldSpec::from_json(&json!({"name": "qty", "type": "integer", "max_length": 4}))
            .unwrap_err();
        assert!(err.to_string().contains("unknown parameter 'max_length'"));
    }

    #[test]
    fn test_decimal_aliases_and_bounds() {
        let spec = FieldSpec::from_json(
            &json!({"name": "total", "type": "decimal", "precision": 12, "scale": 4}),
        )
        .unwrap();
        assert_eq!(spec.kind, FieldKind::decimal(12, 4));

        let err = FieldSpec::from_json(
            &json!({"name": "total", "type": "decimal", "max_digits": 2, "decimal_places": 3}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("decimal_places"));
    }

    #[test]
    fn test_required_implies_not_null_unless_overridden() {
        let spec =
            FieldSpec::from_json(&json!({"name": "code", "type": "char", "required": true}))
                .unwrap();
        assert!(!spec.nullable);

        let spec = FieldSpec::from_json(
            &json!({"name": "code", "type": "char", "required": true, "null": true}),
        )
        .unwrap();
        assert!(spec.nullable);
    }

    #[test]
    fn test_foreign_key_parsing() {
        let spec = FieldSpec::from_json(&json!({
            "name": "invoice", "type": "foreign_key", "to": "Invoice",
            "on_delete": "PROTECT", "related_name": "lines"
        }))
        .unwrap();
        assert_eq!(spec.column_name(), "invoice_id");
        assert_eq!(
            spec.kind,
            FieldKind::ForeignKey {
                to: "Invoice".into(),
                on_delete: OnDelete::Restrict,
                related_name: Some("lines".into()),
            }
        );
    }

    #[test]
    fn test_check_value() {
        let status = FieldSpec::new("status", FieldKind::char(4)).required();
        assert!(status.check_value(&Value::Text("open".into())).is_ok());
        assert!(status.check_value(&Value::Text("closed".into())).is_err());
        assert!(status.check_value(&Value::Null).is_err());

        let due = FieldSpec::new("due", FieldKind::Date);
        assert!(due.check_value(&Value::Text("2024-02-29".into())).is_ok());
        assert!(due.check_value(&Value::Text("tomorrow".into())).is_err());
        assert!(due.check_value(&Value::Null).is_ok());

        let flag = FieldSpec::new("paid", FieldKind::Boolean);
        assert!(flag.check_value(&Value::Integer(1)).is_ok());
        assert!(flag.check_value(&Value::Integer(2)).is_err());
    }

    #[test]
    fn test_serde_round_trip_through_canonical_json() {
        let spec = FieldSpec::new("amount", FieldKind::decimal(10, 2)).default_value(0);
        let text = serde_json::to_string(&spec).unwrap();
        let back: FieldSpec = serde_json::from_str(&text).unwrap();
        assert_eq!(back, spec);
    }
}
