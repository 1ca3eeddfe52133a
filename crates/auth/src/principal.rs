use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobflow_core::TenantId;

use crate::{Permission, Role};

/// Identity of an authenticated principal (operator, service account, etc).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(Uuid);

impl PrincipalId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for PrincipalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// A principal's membership in a tenant.
///
/// `tenant_id == None` is an engine-wide membership (operators that may see
/// every tenant's jobs and batches).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMembership {
    pub tenant_id: Option<TenantId>,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

/// A fully resolved principal for authorization decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub active_tenant_id: Option<TenantId>,
    pub membership: TenantMembership,
}

impl Principal {
    /// Engine-wide principal whose permissions are derived from `roles`.
    pub fn with_roles(principal_id: PrincipalId, roles: Vec<Role>) -> Self {
        let permissions = crate::permissions_for_roles(&roles);
        Self {
            principal_id,
            active_tenant_id: None,
            membership: TenantMembership {
                tenant_id: None,
                roles,
                permissions,
            },
        }
    }

    /// Principal acting within one tenant.
    pub fn for_tenant(principal_id: PrincipalId, tenant_id: TenantId, roles: Vec<Role>) -> Self {
        let permissions = crate::permissions_for_roles(&roles);
        Self {
            principal_id,
            active_tenant_id: Some(tenant_id),
            membership: TenantMembership {
                tenant_id: Some(tenant_id),
                roles,
                permissions,
            },
        }
    }
}
