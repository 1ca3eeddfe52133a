//! Optimistic-lock revisions.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Monotonically increasing revision of a stored entity.
///
/// The store assigns `Revision::INITIAL` on insert and bumps it by one on
/// every successful update.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    /// Revision of an entity that has never been persisted.
    pub const NEW: Revision = Revision(0);

    /// Revision assigned by the store on insert.
    pub const INITIAL: Revision = Revision(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_new(self) -> bool {
        self == Self::NEW
    }
}

impl Default for Revision {
    fn default() -> Self {
        Self::NEW
    }
}

impl core::fmt::Display for Revision {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optimistic concurrency expectation for a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedRevision {
    /// The row must not exist yet (insert).
    Absent,
    /// The row must currently be at this revision (update/delete).
    Exact(Revision),
}

impl ExpectedRevision {
    pub fn matches(self, actual: Option<Revision>) -> bool {
        match (self, actual) {
            (ExpectedRevision::Absent, None) => true,
            (ExpectedRevision::Exact(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }

    pub fn check(self, actual: Option<Revision>) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic lock check failed (expected: {self:?}, actual: {actual:?})"
            )))
        }
    }
}
