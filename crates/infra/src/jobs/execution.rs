use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;
use tracing::{debug, warn};

use jobflow_core::EntityId;
use jobflow_jobs::{FailureOutcome, Job};

use crate::context::{CommandContext, TransactionPhase};
use crate::error::{EngineError, JobError};
use crate::interceptor::Operation;

use super::failure::HandleJobFailure;
use super::handler::JobExecution;

/// Outcome of a committed `ExecuteJob`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRun {
    /// Handler succeeded; the job row is deleted.
    Succeeded,
    /// Job vanished or belongs to another owner.
    Skipped,
}

/// Receives the retry transition applied after a failed execution.
#[derive(Debug, Clone, Default)]
pub struct FailureReport(Rc<RefCell<Option<FailureOutcome>>>);

impl FailureReport {
    pub fn outcome(&self) -> Option<FailureOutcome> {
        self.0.borrow().clone()
    }

    fn record(&self, outcome: FailureOutcome) {
        *self.0.borrow_mut() = Some(outcome);
    }
}

/// Runs the registered handler for one job and deletes the job on success.
///
/// A handler error rolls the unit of work back; a `RolledBack` listener then
/// applies `HandleJobFailure` in a fresh unit of work. Optimistic-lock
/// conflicts roll back without touching the job's retries.
#[derive(Debug, Clone)]
pub struct ExecuteJob {
    pub job_id: EntityId,
    /// Owner the job must still be locked by; `None` for manual execution.
    pub lock_owner: Option<String>,
    report: Option<FailureReport>,
}

impl ExecuteJob {
    pub fn new(job_id: EntityId) -> Self {
        Self {
            job_id,
            lock_owner: None,
            report: None,
        }
    }

    pub fn locked_by(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }

    pub fn reporting_to(mut self, report: FailureReport) -> Self {
        self.report = Some(report);
        self
    }
}

impl Operation for ExecuteJob {
    type Output = JobRun;

    fn name(&self) -> &str {
        "execute_job"
    }

    fn execute(&mut self, ctx: &mut CommandContext) -> Result<JobRun, EngineError> {
        let Some(job) = ctx.unit_of_work().find::<Job>(self.job_id)? else {
            debug!(job_id = %self.job_id, "job no longer exists");
            return Ok(JobRun::Skipped);
        };
        if let Some(owner) = &self.lock_owner {
            if !job.is_locked_by(owner, Utc::now()) {
                debug!(job_id = %job.id, owner = %owner, "job is not locked by this owner");
                return Ok(JobRun::Skipped);
            }
        }

        let job_id = job.id;
        let lock_owner = self.lock_owner.clone();
        let report = self.report.clone();
        ctx.add_listener(TransactionPhase::RolledBack, move |ctx| {
            let (message, retryable) = match ctx.rollback_cause() {
                None => return Ok(()),
                Some(cause) if cause.is_optimistic_lock() => {
                    debug!(job_id = %job_id, error = %cause, "job execution conflicted");
                    return Ok(());
                }
                Some(EngineError::Job(error)) => (error.message().to_string(), error.is_retryable()),
                Some(other) => (other.to_string(), true),
            };

            let mut failure = HandleJobFailure::new(job_id, message, retryable);
            if let Some(owner) = lock_owner {
                failure = failure.held_by(owner);
            }
            let outcome = ctx.requires_new(failure)?;
            if let (Some(report), Some(outcome)) = (report, outcome) {
                report.record(outcome);
            }
            Ok(())
        });

        let handler = ctx
            .services()
            .job_handlers
            .get(&job.job_type)
            .cloned()
            .ok_or_else(|| JobError::fatal(format!("no handler for job type '{}'", job.job_type)))?;

        let execution = JobExecution::from(&job);
        if let Err(error) = handler(&execution, ctx) {
            warn!(job_id = %job.id, job_type = %job.job_type, error = %error, "job handler failed");
            return Err(error.into());
        }

        ctx.unit_of_work().register_delete::<Job>(job_id)?;
        debug!(job_id = %job_id, job_type = %job.job_type, "job succeeded");
        Ok(JobRun::Succeeded)
    }
}
