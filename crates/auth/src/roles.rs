use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::Permission;

/// Role identifier used for RBAC.
///
/// Roles are opaque strings; [`permissions_for_roles`] is the built-in
/// role→permission policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const ADMIN: Role = Role(Cow::Borrowed("admin"));
    pub const OPERATOR: Role = Role(Cow::Borrowed("operator"));
    pub const VIEWER: Role = Role(Cow::Borrowed("viewer"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Built-in role→permission mapping.
///
/// - `admin` grants the wildcard
/// - `operator` may inspect and repair jobs, incidents and batches
/// - `viewer` is read-only
pub fn permissions_for_roles(roles: &[Role]) -> Vec<Permission> {
    if roles.iter().any(|r| r == &Role::ADMIN) {
        return vec![Permission::WILDCARD];
    }

    let mut perms = Vec::new();
    for role in roles {
        let granted: Vec<Permission> = match role.as_str() {
            "operator" => vec![
                Permission::JOB_READ,
                Permission::JOB_UPDATE,
                Permission::JOB_DELETE,
                Permission::INCIDENT_READ,
                Permission::BATCH_CREATE,
                Permission::BATCH_READ,
                Permission::BATCH_UPDATE,
                Permission::BATCH_DELETE,
            ],
            "viewer" => vec![
                Permission::JOB_READ,
                Permission::INCIDENT_READ,
                Permission::BATCH_READ,
            ],
            _ => Vec::new(),
        };
        for p in granted {
            if !perms.contains(&p) {
                perms.push(p);
            }
        }
    }
    perms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_gets_wildcard() {
        assert_eq!(permissions_for_roles(&[Role::ADMIN]), vec![Permission::WILDCARD]);
    }

    #[test]
    fn viewer_cannot_update() {
        let perms = permissions_for_roles(&[Role::VIEWER]);
        assert!(perms.contains(&Permission::JOB_READ));
        assert!(!perms.contains(&Permission::JOB_UPDATE));
    }

    #[test]
    fn unknown_roles_grant_nothing() {
        assert!(permissions_for_roles(&[Role::new("guest")]).is_empty());
    }
}
