use chrono::Utc;
use tracing::{debug, warn};

use jobflow_core::EntityId;
use jobflow_jobs::{FailureOutcome, Incident, Job};

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::interceptor::Operation;

/// Applies a handler failure to a job: reschedule with backoff, or exhaust
/// it and open a `FailedJob` incident.
///
/// Runs in its own unit of work after the failed execution rolled back.
#[derive(Debug, Clone)]
pub struct HandleJobFailure {
    pub job_id: EntityId,
    pub message: String,
    pub retryable: bool,
    /// Skip the transition if the job is no longer held by this owner.
    pub lock_owner: Option<String>,
}

impl HandleJobFailure {
    pub fn new(job_id: EntityId, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            job_id,
            message: message.into(),
            retryable,
            lock_owner: None,
        }
    }

    pub fn held_by(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }
}

impl Operation for HandleJobFailure {
    type Output = Option<FailureOutcome>;

    fn name(&self) -> &str {
        "handle_job_failure"
    }

    fn execute(&mut self, ctx: &mut CommandContext) -> Result<Self::Output, EngineError> {
        let now = Utc::now();
        let policy = ctx.config().retry_policy.clone();

        let Some(job) = ctx.unit_of_work().get_or_load::<Job>(self.job_id)? else {
            debug!(job_id = %self.job_id, "failed job no longer exists");
            return Ok(None);
        };
        if let Some(owner) = &self.lock_owner {
            if job.lock_owner.as_deref() != Some(owner.as_str()) {
                debug!(job_id = %self.job_id, owner = %owner, "failed job was re-acquired elsewhere");
                return Ok(None);
            }
        }

        let outcome = job.fail(self.message.clone(), self.retryable, &policy, now);
        match &outcome {
            FailureOutcome::Rescheduled {
                retries_left,
                due_date,
            } => {
                debug!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retries_left,
                    due_date = %due_date,
                    "job rescheduled"
                );
            }
            FailureOutcome::Exhausted => {
                let incident = Incident::failed_job(job);
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    error = %self.message,
                    "job exhausted its retries"
                );
                ctx.unit_of_work().register_insert(incident);
            }
        }
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use jobflow_jobs::RetryPolicy;

    use super::*;
    use crate::config::EngineConfig;
    use crate::interceptor::CommandExecutor;
    use crate::services::EngineServices;
    use crate::store::{InMemoryEntityStore, RecordQuery};

    fn executor() -> CommandExecutor {
        let config = EngineConfig::default().with_retry_policy(RetryPolicy::fixed(Duration::from_secs(10)));
        let services = EngineServices::new(Arc::new(InMemoryEntityStore::new()), config);
        CommandExecutor::standard(Arc::new(services))
    }

    fn insert(executor: &CommandExecutor, job: Job) -> EntityId {
        executor
            .execute_fn("insert_job", move |ctx| Ok(ctx.unit_of_work().register_insert(job)))
            .unwrap()
    }

    fn incidents(executor: &CommandExecutor) -> Vec<Incident> {
        executor
            .execute_fn("incidents", |ctx| {
                Ok(ctx.unit_of_work().query::<Incident>(&RecordQuery::of::<Incident>())?)
            })
            .unwrap()
    }

    #[test]
    fn retryable_failure_reschedules() {
        let executor = executor();
        let id = insert(&executor, Job::new("t", json!({})).with_retries(3));

        let outcome = executor
            .execute(HandleJobFailure::new(id, "boom", true))
            .unwrap();
        assert!(matches!(
            outcome,
            Some(FailureOutcome::Rescheduled { retries_left: 2, .. })
        ));
        assert!(incidents(&executor).is_empty());
    }

    #[test]
    fn last_retry_exhausts_and_opens_incident() {
        let executor = executor();
        let id = insert(&executor, Job::new("t", json!({})).with_retries(1));

        let outcome = executor
            .execute(HandleJobFailure::new(id, "boom", true))
            .unwrap();
        assert_eq!(outcome, Some(FailureOutcome::Exhausted));

        let incidents = incidents(&executor);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].job_id, Some(id));
        assert_eq!(incidents[0].message, "boom");
    }

    #[test]
    fn fatal_failure_exhausts_immediately() {
        let executor = executor();
        let id = insert(&executor, Job::new("t", json!({})).with_retries(5));

        let outcome = executor
            .execute(HandleJobFailure::new(id, "bad payload", false))
            .unwrap();
        assert_eq!(outcome, Some(FailureOutcome::Exhausted));
    }

    #[test]
    fn foreign_lock_is_left_alone() {
        let executor = executor();
        let mut job = Job::new("t", json!({}));
        job.lock("node-b", Utc::now() + chrono::Duration::minutes(1));
        let id = insert(&executor, job);

        let outcome = executor
            .execute(HandleJobFailure::new(id, "boom", true).held_by("node-a"))
            .unwrap();
        assert_eq!(outcome, None);
    }
}
