//! Engine-level error model.

use thiserror::Error;

use jobflow_auth::AuthzError;
use jobflow_core::DomainError;

use crate::store::StoreError;

/// Failure reported by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Transient failure; the job is retried while retries remain.
    #[error("retryable job failure: {0}")]
    Retryable(String),
    /// Permanent failure; the job is exhausted immediately.
    #[error("fatal job failure: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Retryable(msg) | JobError::Fatal(msg) => msg,
        }
    }
}

/// Error returned by operations executed through the command pipeline.
///
/// `Clone` so the rollback cause can be handed to transaction listeners.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A flush lost a revision race (stale read or concurrent delete).
    #[error("optimistic lock conflict: {0}")]
    OptimisticLock(String),

    #[error("authorization failed: {0}")]
    Authorization(#[from] AuthzError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("domain error: {0}")]
    Domain(DomainError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, EngineError::OptimisticLock(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::OptimisticLock(_) => EngineError::OptimisticLock(value.to_string()),
            StoreError::Serialization(msg) => EngineError::Serialization(msg),
            other => EngineError::Store(other),
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => EngineError::Validation(msg),
            DomainError::Conflict(msg) => EngineError::OptimisticLock(msg),
            DomainError::NotFound => EngineError::NotFound("entity".to_string()),
            other => EngineError::Domain(other),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        EngineError::Serialization(value.to_string())
    }
}
