//! Identifier rules and generated names for tables and indexes.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::core::{DbError, Result};

/// Longest identifier accepted for models, tables and fields.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Index names longer than this are shortened with a hash suffix.
pub const MAX_INDEX_NAME_LENGTH: usize = 60;

/// Field names owned by the runtime itself or by its object protocol.
pub const RESERVED_FIELD_NAMES: &[&str] = &[
    "id",
    "pk",
    "create_time",
    "update_time",
    "objects",
    "save",
    "delete",
    "clean",
    "full_clean",
    "serializable_value",
    "_state",
    "_meta",
    "DoesNotExist",
    "MultipleObjectsReturned",
];

lazy_static! {
    static ref IDENTIFIER_PATTERN: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

const FORBIDDEN_SQL_FRAGMENTS: [&str; 4] = [";", "--", "/*", "*/"];

/// Checks the identifier rule; `kind` names the thing being checked in the error.
pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DbError::Validation(format!("{} name cannot be empty", kind)));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(DbError::Validation(format!(
            "{} name '{}' exceeds {} characters",
            kind, name, MAX_IDENTIFIER_LENGTH
        )));
    }
    if !IDENTIFIER_PATTERN.is_match(name) {
        return Err(DbError::Validation(format!(
            "{} name '{}' must start with a letter or underscore and contain only letters, digits and underscores",
            kind, name
        )));
    }
    Ok(())
}

pub fn is_reserved_field_name(name: &str) -> bool {
    RESERVED_FIELD_NAMES.contains(&name)
}

/// Validates a user-declared field name: identifier rule plus reserved names.
pub fn validate_field_name(name: &str) -> Result<()> {
    validate_identifier("Field", name)?;
    if is_reserved_field_name(name) {
        return Err(DbError::Validation(format!(
            "Field name '{}' is reserved",
            name
        )));
    }
    Ok(())
}

/// Validates a table name coming from outside a model declaration.
pub fn validate_table_name(name: &str) -> Result<()> {
    if let Some(fragment) = FORBIDDEN_SQL_FRAGMENTS
        .iter()
        .find(|fragment| name.contains(**fragment))
    {
        return Err(DbError::Validation(format!(
            "Table name '{}' contains forbidden sequence '{}'",
            name, fragment
        )));
    }
    validate_identifier("Table", name)
}

/// Converts non-alphanumeric characters to underscores and lowercases the result.
pub fn sanitize_sql_identifier(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Deterministic table name for a model: `<prefix><lower(model)>`, truncated.
pub fn default_table_name(prefix: &str, model_name: &str) -> String {
    let mut name = format!("{}{}", prefix, sanitize_sql_identifier(model_name));
    truncate_chars(&mut name, MAX_IDENTIFIER_LENGTH);
    name
}

/// Truncates to at most `max` bytes without splitting a character.
fn truncate_chars(name: &mut String, max: usize) {
    if name.len() <= max {
        return;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.truncate(end);
}

/// Appends `_1`, `_2`, ... until `base` no longer collides with `taken`.
pub fn unique_table_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let mut counter = 1usize;
    loop {
        let suffix = format!("_{}", counter);
        let mut stem = base.to_string();
        truncate_chars(&mut stem, MAX_IDENTIFIER_LENGTH - suffix.len());
        let candidate = format!("{}{}", stem, suffix);
        if !taken.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Index name `idx_<table>_<cols>`; long names become `idx_<table[..30]>_<hash8>`.
pub fn index_name(table_name: &str, columns: &[&str]) -> String {
    prefixed_index_name("idx", table_name, columns)
}

/// Same scheme as [`index_name`] under `uq_`, so a unique index never
/// collides with a plain index on the same columns.
pub fn unique_index_name(table_name: &str, columns: &[&str]) -> String {
    prefixed_index_name("uq", table_name, columns)
}

fn prefixed_index_name(prefix: &str, table_name: &str, columns: &[&str]) -> String {
    let table = sanitize_sql_identifier(table_name);
    let cols = columns
        .iter()
        .map(|c| sanitize_sql_identifier(c))
        .collect::<Vec<_>>()
        .join("_");
    let name = format!("{}_{}_{}", prefix, table, cols);
    if name.len() <= MAX_INDEX_NAME_LENGTH {
        return name;
    }

    let digest = Sha256::digest(name.as_bytes());
    let short_table: String = table.chars().take(30).collect();
    format!("{}_{}_{}", prefix, short_table, &hex::encode(digest)[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_rules() {
        assert!(validate_identifier("Field", "total_amount").is_ok());
        assert!(validate_identifier("Field", "_hidden").is_ok());
        assert!(validate_identifier("Field", "1abc").is_err());
        assert!(validate_identifier("Field", "with space").is_err());
        assert!(validate_identifier("Field", &"a".repeat(64)).is_err());
    }

    #[test]
    fn test_reserved_names_rejected() {
        for name in ["id", "create_time", "update_time", "objects", "_meta"] {
            let err = validate_field_name(name).unwrap_err();
            assert!(err.to_string().contains("reserved"), "{}", name);
        }
    }

    #[test]
    fn test_table_name_injection_rejected() {
        assert!(validate_table_name("orders; DROP TABLE x").is_err());
        assert!(validate_table_name("orders--").is_err());
        assert!(validate_table_name("orders").is_ok());
    }

    #[test]
    fn test_default_and_unique_table_names() {
        assert_eq!(default_table_name("lowcode_", "Invoice"), "lowcode_invoice");

        let mut taken = HashSet::new();
        assert_eq!(unique_table_name("lowcode_invoice", &taken), "lowcode_invoice");
        taken.insert("lowcode_invoice".to_string());
        taken.insert("lowcode_invoice_1".to_string());
        assert_eq!(unique_table_name("lowcode_invoice", &taken), "lowcode_invoice_2");
    }

    #[test]
    fn test_multibyte_prefix_truncates_on_char_boundary() {
        let prefix = format!("{}é_", "a".repeat(62));
        let name = default_table_name(&prefix, "order");
        assert_eq!(name, "a".repeat(62));
        assert!(validate_table_name(&default_table_name("téam_", "order")).is_err());

        let taken: HashSet<String> = [name.clone()].into_iter().collect();
        let next = unique_table_name(&name, &taken);
        assert!(next.len() <= MAX_IDENTIFIER_LENGTH);
        assert!(next.ends_with("_1"));
    }

    #[test]
    fn test_index_name_shortening() {
        assert_eq!(index_name("orders", &["status"]), "idx_orders_status");

        let long_table = "t".repeat(50);
        let name = index_name(&long_table, &["customer_reference"]);
        assert!(name.len() <= MAX_INDEX_NAME_LENGTH);
        assert!(name.starts_with(&format!("idx_{}_", "t".repeat(30))));
        assert_eq!(name, index_name(&long_table, &["customer_reference"]));
    }
}
