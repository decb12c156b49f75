//! Field-set comparison and migration safety checks.
//!
//! The verdicts here are advisory. Whether an unsafe change is blocked or
//! applied with a warning is decided by the caller.

use std::collections::{BTreeMap, HashSet};

use lazy_static::lazy_static;

use crate::schema::field::{FieldSpec, FieldType};

lazy_static! {
    static ref DEFAULT_POLICY: CompatibilityPolicy = CompatibilityPolicy::default();
}

/// One-directional allow-list of type transitions that keep existing data intact.
///
/// Anything not listed is treated as unsafe. The table is policy, not truth:
/// deployments extend it with [`CompatibilityPolicy::allow`].
#[derive(Debug, Clone)]
pub struct CompatibilityPolicy {
    widenings: HashSet<(FieldType, FieldType)>,
}

impl Default for CompatibilityPolicy {
    fn default() -> Self {
        Self::strict()
            .allow(FieldType::Integer, FieldType::BigInteger)
            .allow(FieldType::SmallInteger, FieldType::Integer)
            .allow(FieldType::SmallInteger, FieldType::BigInteger)
            .allow(FieldType::Char, FieldType::Text)
            .allow(FieldType::Email, FieldType::Char)
            .allow(FieldType::Email, FieldType::Text)
            .allow(FieldType::Url, FieldType::Char)
            .allow(FieldType::Url, FieldType::Text)
            .allow(FieldType::Boolean, FieldType::Integer)
            .allow(FieldType::Float, FieldType::Decimal)
    }
}

impl CompatibilityPolicy {
    /// Only identical types are compatible.
    pub fn strict() -> Self {
        Self {
            widenings: HashSet::new(),
        }
    }

    pub fn allow(mut self, from: FieldType, to: FieldType) -> Self {
        self.widenings.insert((from, to));
        self
    }

    pub fn is_type_compatible(&self, old: FieldType, new: FieldType) -> bool {
        old == new || self.widenings.contains(&(old, new))
    }

    pub fn validate(&self, old_fields: &[FieldSpec], new_fields: &[FieldSpec]) -> SafetyVerdict {
        let changes = diff(old_fields, new_fields);

        for change in &changes.modified {
            let (from, to) = (change.old.field_type(), change.new.field_type());
            if !self.is_type_compatible(from, to) {
                return SafetyVerdict::Unsafe {
                    field: change.new.name.clone(),
                    reason: format!(
                        "field '{}' type from '{}' to '{}' may lose data",
                        change.new.name, from, to
                    ),
                };
            }
        }

        for dropped in &changes.dropped {
            if !dropped.nullable && !dropped.has_default() {
                return SafetyVerdict::Unsafe {
                    field: dropped.name.clone(),
                    reason: format!(
                        "dropping non-nullable field '{}' without a default would orphan existing rows",
                        dropped.name
                    ),
                };
            }
        }

        SafetyVerdict::Safe
    }
}

/// A field present in both versions whose declaration changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub old: FieldSpec,
    pub new: FieldSpec,
}

impl FieldChange {
    pub fn type_changed(&self) -> bool {
        self.old.field_type() != self.new.field_type()
    }
}

/// Result of comparing two field sets by name. Each list is sorted by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDiff {
    pub added: Vec<FieldSpec>,
    pub dropped: Vec<FieldSpec>,
    pub modified: Vec<FieldChange>,
}

impl FieldDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty() && self.modified.is_empty()
    }

    /// Names touched by the diff.
    pub fn changed_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .added
            .iter()
            .chain(&self.dropped)
            .map(|f| f.name.as_str())
            .chain(self.modified.iter().map(|c| c.new.name.as_str()))
            .collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Unsafe { field: String, reason: String },
}

impl SafetyVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Safe)
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Safe => "",
            Self::Unsafe { reason, .. } => reason,
        }
    }
}

pub fn diff(old_fields: &[FieldSpec], new_fields: &[FieldSpec]) -> FieldDiff {
    let old: BTreeMap<&str, &FieldSpec> = old_fields.iter().map(|f| (f.name.as_str(), f)).collect();
    let new: BTreeMap<&str, &FieldSpec> = new_fields.iter().map(|f| (f.name.as_str(), f)).collect();

    let mut result = FieldDiff::default();
    for (name, field) in &new {
        match old.get(name) {
            None => result.added.push((*field).clone()),
            Some(previous) if *previous != *field => result.modified.push(FieldChange {
                old: (*previous).clone(),
                new: (*field).clone(),
            }),
            Some(_) => {}
        }
    }
    for (name, field) in &old {
        if !new.contains_key(name) {
            result.dropped.push((*field).clone());
        }
    }
    result
}

pub fn is_type_compatible(old: FieldType, new: FieldType) -> bool {
    DEFAULT_POLICY.is_type_compatible(old, new)
}

/// Validates with the default compatibility table.
pub fn validate(old_fields: &[FieldSpec], new_fields: &[FieldSpec]) -> SafetyVerdict {
    DEFAULT_POLICY.validate(old_fields, new_fields)
}
