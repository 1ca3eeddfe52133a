//! `jobflow-auth`: pure authorization boundary for engine operations.
//!
//! This crate is intentionally decoupled from storage and transport: callers
//! build a [`Principal`] and the interceptor pipeline checks it against the
//! permissions each operation declares.

pub mod authorize;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{AuthzError, authorize, authorize_all, can_access_tenant};
pub use permissions::Permission;
pub use principal::{Principal, PrincipalId, TenantMembership};
pub use roles::{Role, permissions_for_roles};
