//! Role and row-level checks run before a method body.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;

use super::context::Caller;
use crate::core::DbError;

/// Resolves a user to the ids of the roles it holds.
pub trait RoleLookup: Send + Sync {
    fn current_role_ids(&self, user: &str) -> BTreeSet<String>;
}

/// Decides whether a user may touch one specific row.
pub trait RowGrants: Send + Sync {
    fn has_row_grant(&self, user: &str, model_name: &str, row_id: i64) -> bool;
}

impl<F> RoleLookup for F
where
    F: Fn(&str) -> BTreeSet<String> + Send + Sync,
{
    fn current_role_ids(&self, user: &str) -> BTreeSet<String> {
        self(user)
    }
}

impl<F> RowGrants for F
where
    F: Fn(&str, &str, i64) -> bool + Send + Sync,
{
    fn has_row_grant(&self, user: &str, model_name: &str, row_id: i64) -> bool {
        self(user, model_name, row_id)
    }
}

/// Grants every row to every authenticated user.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllRows;

impl RowGrants for AllowAllRows {
    fn has_row_grant(&self, _user: &str, _model_name: &str, _row_id: i64) -> bool {
        true
    }
}

/// In-memory user → roles and (user, model, row) grant tables.
#[derive(Debug, Default)]
pub struct StaticPermissions {
    roles: RwLock<HashMap<String, BTreeSet<String>>>,
    grants: RwLock<HashSet<(String, String, i64)>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_role(&self, user: &str, role: &str) {
        self.roles
            .write()
            .entry(user.to_string())
            .or_default()
            .insert(role.to_string());
    }

    pub fn grant_row(&self, user: &str, model_name: &str, row_id: i64) {
        self.grants
            .write()
            .insert((user.to_string(), model_name.to_string(), row_id));
    }

    pub fn revoke_row(&self, user: &str, model_name: &str, row_id: i64) -> bool {
        self.grants
            .write()
            .remove(&(user.to_string(), model_name.to_string(), row_id))
    }
}

impl RoleLookup for StaticPermissions {
    fn current_role_ids(&self, user: &str) -> BTreeSet<String> {
        self.roles.read().get(user).cloned().unwrap_or_default()
    }
}

impl RowGrants for StaticPermissions {
    fn has_row_grant(&self, user: &str, model_name: &str, row_id: i64) -> bool {
        self.grants
            .read()
            .contains(&(user.to_string(), model_name.to_string(), row_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Denied(String),
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }

    pub fn into_result(self) -> Result<(), DbError> {
        match self {
            Self::Granted => Ok(()),
            Self::Denied(reason) => Err(DbError::PermissionDenied(reason)),
        }
    }
}

/// Role gate: an empty `allowed` set admits any authenticated caller.
pub fn check_roles(
    caller: &Caller,
    allowed: &BTreeSet<String>,
    roles: &dyn RoleLookup,
    target: &str,
) -> Decision {
    let Some(user) = caller.id() else {
        return Decision::Denied(format!("authentication required to call {}", target));
    };
    if allowed.is_empty() {
        return Decision::Granted;
    }
    let held = roles.current_role_ids(user);
    if allowed.intersection(&held).next().is_some() {
        Decision::Granted
    } else {
        Decision::Denied(format!("user '{}' lacks a role allowed to call {}", user, target))
    }
}

/// Row gate; superusers hold every row.
pub fn check_row(caller: &Caller, grants: &dyn RowGrants, model_name: &str, row_id: i64) -> Decision {
    match caller {
        Caller::Anonymous => Decision::Denied("authentication required".into()),
        Caller::User { superuser: true, .. } => Decision::Granted,
        Caller::User { id, .. } => {
            if grants.has_row_grant(id, model_name, row_id) {
                Decision::Granted
            } else {
                Decision::Denied(format!(
                    "user '{}' has no access to {} row {}",
                    id, model_name, row_id
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_empty_role_set_admits_authenticated_callers() {
        let lookup = StaticPermissions::new();
        assert!(check_roles(&Caller::user("bob"), &BTreeSet::new(), &lookup, "m").is_granted());
        assert!(!check_roles(&Caller::Anonymous, &BTreeSet::new(), &lookup, "m").is_granted());
    }

    #[test]
    fn test_role_intersection() {
        let lookup = StaticPermissions::new();
        lookup.assign_role("alice", "admin");
        let admin_only = roles(&["admin"]);

        assert!(check_roles(&Caller::user("alice"), &admin_only, &lookup, "m").is_granted());
        let denied = check_roles(&Caller::user("bob"), &admin_only, &lookup, "m");
        assert!(matches!(
            denied.into_result(),
            Err(DbError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_closure_lookup() {
        let lookup = |user: &str| {
            if user == "carol" {
                roles(&["sales"])
            } else {
                BTreeSet::new()
            }
        };
        assert!(check_roles(&Caller::user("carol"), &roles(&["sales"]), &lookup, "m").is_granted());
    }

    #[test]
    fn test_row_grants_and_superuser_bypass() {
        let grants = StaticPermissions::new();
        grants.grant_row("alice", "Invoice", 1);

        assert!(check_row(&Caller::user("alice"), &grants, "Invoice", 1).is_granted());
        assert!(!check_row(&Caller::user("alice"), &grants, "Invoice", 2).is_granted());
        assert!(check_row(&Caller::superuser("root"), &grants, "Invoice", 2).is_granted());
        assert!(grants.revoke_row("alice", "Invoice", 1));
        assert!(!check_row(&Caller::user("alice"), &grants, "Invoice", 1).is_granted());
    }
}
