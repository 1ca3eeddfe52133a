//! Job entity and its lock protocol.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobflow_core::{Entity, EntityId, Revision, TenantId};

use crate::retry::RetryPolicy;

/// Retries a job gets unless the creator says otherwise.
pub const DEFAULT_RETRIES: u32 = 3;

/// `from + delay`, or `None` when the result falls outside chrono's range.
pub fn instant_after(from: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    ChronoDuration::from_std(delay)
        .ok()
        .and_then(|delay| from.checked_add_signed(delay))
}

/// Persisted field names, for building store queries.
pub mod fields {
    pub const JOB_TYPE: &str = "job_type";
    pub const DUE_DATE: &str = "due_date";
    pub const RETRIES: &str = "retries";
    pub const LOCK_OWNER: &str = "lock_owner";
    pub const LOCK_EXPIRATION: &str = "lock_expiration";
    pub const EXCLUSIVE: &str = "exclusive";
    pub const ASSOCIATED_ENTITY_ID: &str = "associated_entity_id";
    pub const PRIORITY: &str = "priority";
    pub const SUSPENDED: &str = "suspended";
    pub const JOB_DEFINITION_ID: &str = "job_definition_id";
    pub const TENANT_ID: &str = "tenant_id";
    pub const EXCEPTION_MESSAGE: &str = "exception_message";
    pub const CREATED_AT: &str = "created_at";
}

/// A persisted continuation picked up by the job executor.
///
/// Dates are stored as epoch milliseconds so the store can compare them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: EntityId,
    #[serde(skip)]
    revision: Revision,
    pub job_type: String,
    #[serde(default)]
    pub configuration: JsonValue,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub due_date: Option<DateTime<Utc>>,
    pub retries: u32,
    #[serde(default)]
    pub lock_owner: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub lock_expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub associated_entity_id: Option<EntityId>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub job_definition_id: Option<EntityId>,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub exception_message: Option<String>,
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Scheduler-facing state of a job at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Acquirable now.
    Due,
    /// Due date lies in the future.
    Pending,
    /// Held by `owner` until `expires_at`.
    Locked {
        owner: String,
        expires_at: DateTime<Utc>,
    },
    /// No retries left; an incident is expected to exist.
    Exhausted,
    Suspended,
}

/// Result of applying a handler failure to a locked job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `Due` at `due_date` with `retries_left` attempts.
    Rescheduled {
        retries_left: u32,
        due_date: DateTime<Utc>,
    },
    /// No retries left; the caller must record an incident.
    Exhausted,
}

/// What an operator retry change implies for the job's incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetriesChange {
    /// Exhausted job got retries back; its incident is resolved.
    Restored,
    /// Retries were set to zero by hand; an incident must be created.
    Exhausted,
    Unchanged,
}

impl Job {
    pub fn new(job_type: impl Into<String>, configuration: JsonValue) -> Self {
        Self {
            id: EntityId::new(),
            revision: Revision::NEW,
            job_type: job_type.into(),
            configuration,
            due_date: None,
            retries: DEFAULT_RETRIES,
            lock_owner: None,
            lock_expiration: None,
            exclusive: false,
            associated_entity_id: None,
            priority: 0,
            suspended: false,
            job_definition_id: None,
            tenant_id: None,
            exception_message: None,
            failed_attempts: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the job exclusive: jobs sharing `entity_id` never run concurrently.
    pub fn exclusive_for(mut self, entity_id: EntityId) -> Self {
        self.exclusive = true;
        self.associated_entity_id = Some(entity_id);
        self
    }

    pub fn associated_with(mut self, entity_id: EntityId) -> Self {
        self.associated_entity_id = Some(entity_id);
        self
    }

    pub fn with_definition(mut self, definition_id: EntityId) -> Self {
        self.job_definition_id = Some(definition_id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// Held by some owner whose lock has not expired.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration.is_some_and(|exp| exp >= now)
    }

    pub fn is_locked_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.is_locked(now) && self.lock_owner.as_deref() == Some(owner)
    }

    pub fn is_exhausted(&self) -> bool {
        self.retries == 0
    }

    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && !self.is_locked(now) && !self.is_exhausted() && !self.suspended
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.suspended {
            return JobState::Suspended;
        }
        if self.is_exhausted() {
            return JobState::Exhausted;
        }
        if self.is_locked(now) {
            if let (Some(owner), Some(expires_at)) = (&self.lock_owner, self.lock_expiration) {
                return JobState::Locked {
                    owner: owner.clone(),
                    expires_at,
                };
            }
        }
        if self.is_due(now) {
            JobState::Due
        } else {
            JobState::Pending
        }
    }

    pub fn lock(&mut self, owner: impl Into<String>, expires_at: DateTime<Utc>) {
        self.lock_owner = Some(owner.into());
        self.lock_expiration = Some(expires_at);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }

    /// Applies a handler failure.
    ///
    /// A retryable failure with more than one retry left reschedules the job
    /// after the policy's backoff; anything else exhausts it.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        retryable: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        self.exception_message = Some(message.into());
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.unlock();

        if retryable && self.retries > 1 {
            self.retries -= 1;
            let delay = policy.delay_for_attempt(self.failed_attempts);
            let due_date = instant_after(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.due_date = Some(due_date);
            FailureOutcome::Rescheduled {
                retries_left: self.retries,
                due_date,
            }
        } else {
            self.retries = 0;
            FailureOutcome::Exhausted
        }
    }

    /// Operator override of the retry count.
    pub fn set_retries(&mut self, retries: u32) -> RetriesChange {
        let was_exhausted = self.is_exhausted();
        self.retries = retries;
        match (was_exhausted, retries) {
            (true, n) if n > 0 => {
                self.exception_message = None;
                RetriesChange::Restored
            }
            (false, 0) => RetriesChange::Exhausted,
            _ => RetriesChange::Unchanged,
        }
    }
}

impl Entity for Job {
    const ENTITY_TYPE: &'static str = "job";

    fn id(&self) -> EntityId {
        self.id
    }

    fn revision(&self) -> Revision {
        self.revision
    }

    fn set_revision(&mut self, revision: Revision) {
        self.revision = revision;
    }
}
