use std::collections::HashSet;

use thiserror::Error;

use jobflow_core::TenantId;

use crate::{Permission, Principal};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),

    #[error("forbidden: entity belongs to another tenant")]
    TenantForbidden,
}

/// Authorize a principal for one permission within its active tenant context.
///
/// - No IO
/// - No panics
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    if principal.active_tenant_id != principal.membership.tenant_id {
        return Err(AuthzError::TenantMismatch);
    }

    let perms: HashSet<&str> = principal
        .membership
        .permissions
        .iter()
        .map(|p| p.as_str())
        .collect();

    if perms.contains("*") || perms.contains(required.as_str()) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// Authorize every permission in `required`, failing on the first missing one.
pub fn authorize_all(principal: &Principal, required: &[Permission]) -> Result<(), AuthzError> {
    for perm in required {
        authorize(principal, perm)?;
    }
    Ok(())
}

/// Whether `principal` may see an entity owned by `entity_tenant`.
///
/// Engine-wide principals see everything; tenant principals see their own
/// tenant's entities and tenant-less (shared) ones.
pub fn can_access_tenant(principal: &Principal, entity_tenant: Option<TenantId>) -> bool {
    match (principal.active_tenant_id, entity_tenant) {
        (None, _) => true,
        (Some(_), None) => true,
        (Some(active), Some(owner)) => active == owner,
    }
}
