use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier.
///
/// Permissions are opaque `resource:action` strings (e.g. `"job:update"`).
/// The wildcard permission `"*"` grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const WILDCARD: Permission = Permission(Cow::Borrowed("*"));
    pub const JOB_READ: Permission = Permission(Cow::Borrowed("job:read"));
    pub const JOB_UPDATE: Permission = Permission(Cow::Borrowed("job:update"));
    pub const JOB_DELETE: Permission = Permission(Cow::Borrowed("job:delete"));
    pub const INCIDENT_READ: Permission = Permission(Cow::Borrowed("incident:read"));
    pub const BATCH_CREATE: Permission = Permission(Cow::Borrowed("batch:create"));
    pub const BATCH_READ: Permission = Permission(Cow::Borrowed("batch:read"));
    pub const BATCH_UPDATE: Permission = Permission(Cow::Borrowed("batch:update"));
    pub const BATCH_DELETE: Permission = Permission(Cow::Borrowed("batch:delete"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }

    /// The resource part of a `resource:action` permission.
    pub fn resource(&self) -> &str {
        self.as_str().split(':').next().unwrap_or_default()
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
