use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use jobflow_core::{EntityId, ExpectedRevision, Revision};

use super::query::RecordQuery;

/// A persisted record as the store returns it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub entity_type: String,
    pub id: EntityId,
    pub revision: Revision,
    pub payload: JsonValue,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl core::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        })
    }
}

/// One write in an atomic batch.
///
/// Updates and deletes carry the revision the writer read; the store rejects
/// them if the stored revision differs (or the row is gone).
#[derive(Debug, Clone, PartialEq)]
pub enum DbOperation {
    Insert {
        entity_type: String,
        id: EntityId,
        payload: JsonValue,
    },
    Update {
        entity_type: String,
        id: EntityId,
        expected: Revision,
        payload: JsonValue,
    },
    Delete {
        entity_type: String,
        id: EntityId,
        expected: Revision,
    },
}

impl DbOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            DbOperation::Insert { .. } => OperationKind::Insert,
            DbOperation::Update { .. } => OperationKind::Update,
            DbOperation::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn entity_type(&self) -> &str {
        match self {
            DbOperation::Insert { entity_type, .. }
            | DbOperation::Update { entity_type, .. }
            | DbOperation::Delete { entity_type, .. } => entity_type,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            DbOperation::Insert { id, .. }
            | DbOperation::Update { id, .. }
            | DbOperation::Delete { id, .. } => *id,
        }
    }

    pub fn expected_revision(&self) -> ExpectedRevision {
        match self {
            DbOperation::Insert { .. } => ExpectedRevision::Absent,
            DbOperation::Update { expected, .. } | DbOperation::Delete { expected, .. } => {
                ExpectedRevision::Exact(*expected)
            }
        }
    }

    /// Revision the row has after this operation is applied.
    pub fn resulting_revision(&self) -> Revision {
        match self {
            DbOperation::Insert { .. } => Revision::INITIAL,
            DbOperation::Update { expected, .. } => expected.next(),
            DbOperation::Delete { expected, .. } => *expected,
        }
    }

    /// Failure record for this operation given the revision actually stored.
    pub fn failure(&self, index: usize, actual: Option<Revision>) -> OptimisticLockFailure {
        OptimisticLockFailure {
            index,
            entity_type: self.entity_type().to_string(),
            id: self.id(),
            kind: self.kind(),
            expected: self.expected_revision(),
            actual,
        }
    }
}

/// One rejected operation of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticLockFailure {
    /// Position of the operation in the submitted batch.
    pub index: usize,
    pub entity_type: String,
    pub id: EntityId,
    pub kind: OperationKind,
    pub expected: ExpectedRevision,
    pub actual: Option<Revision>,
}

impl core::fmt::Display for OptimisticLockFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} {}:{} (expected {:?}, actual {:?})",
            self.kind, self.entity_type, self.id, self.expected, self.actual
        )
    }
}

/// Entity store error.
///
/// These are infrastructure errors (storage, concurrency) as opposed to
/// domain errors raised by entity transitions.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("optimistic lock failure on {} operation(s): {}", .0.len(), describe(.0))]
    OptimisticLock(Vec<OptimisticLockFailure>),

    #[error("invalid store operation: {0}")]
    InvalidOperation(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

fn describe(failures: &[OptimisticLockFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl StoreError {
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, StoreError::OptimisticLock(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

/// Revisioned record store shared by every engine instance.
///
/// ## Implementation Requirements
///
/// - `apply` is atomic: either every operation is applied or none is
/// - every failing operation of a rejected batch is reported, not just the first
/// - inserts start at `Revision::INITIAL`; updates bump the revision by one
/// - `query` honours criteria, sort keys (nulls last unless the key says first, ties by id) and limit
pub trait EntityStore: Send + Sync {
    fn load(&self, entity_type: &str, id: EntityId) -> Result<Option<StoredRecord>, StoreError>;

    fn query(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>, StoreError>;

    /// Number of matching records, ignoring the query's limit.
    fn count(&self, query: &RecordQuery) -> Result<usize, StoreError>;

    /// Apply a batch atomically, returning the resulting revision per operation.
    fn apply(&self, operations: Vec<DbOperation>) -> Result<Vec<Revision>, StoreError>;
}

impl<S> EntityStore for Arc<S>
where
    S: EntityStore + ?Sized,
{
    fn load(&self, entity_type: &str, id: EntityId) -> Result<Option<StoredRecord>, StoreError> {
        (**self).load(entity_type, id)
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>, StoreError> {
        (**self).query(query)
    }

    fn count(&self, query: &RecordQuery) -> Result<usize, StoreError> {
        (**self).count(query)
    }

    fn apply(&self, operations: Vec<DbOperation>) -> Result<Vec<Revision>, StoreError> {
        (**self).apply(operations)
    }
}
