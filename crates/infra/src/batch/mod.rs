//! Batch pattern.
//!
//! A batch fans a list of targets out into work jobs without creating them
//! all in one transaction:
//!
//! - `create`: `CreateBatch` inserts the batch, its three job definitions,
//!   the first seed job and the first monitor job
//! - `seed`: each seed run creates a slice of work jobs and, while targets
//!   remain, the next seed job
//! - `work`: applies the batch handler to every target of one work job
//! - `monitor`: polls until no seed or work jobs remain, then completes the batch

pub mod create;
pub mod handler;
pub mod monitor;
pub mod seed;
pub mod work;

use serde::de::DeserializeOwned;

use jobflow_jobs::batch::{MONITOR_JOB_TYPE, SEED_JOB_TYPE, WORK_JOB_TYPE};

use crate::error::JobError;
use crate::jobs::{JobExecution, JobHandlerRegistry};

pub use create::CreateBatch;
pub use handler::{BatchHandlerRegistry, BatchJobHandler, FnBatchHandler};

/// Adds the seed, work and monitor job handlers.
pub fn register_job_handlers(registry: &mut JobHandlerRegistry) {
    registry.register(SEED_JOB_TYPE, seed::execute);
    registry.register(WORK_JOB_TYPE, work::execute);
    registry.register(MONITOR_JOB_TYPE, monitor::execute);
}

/// A configuration that does not parse will never parse; fail fast.
fn job_configuration<T: DeserializeOwned>(execution: &JobExecution) -> Result<T, JobError> {
    serde_json::from_value(execution.configuration.clone()).map_err(|e| {
        JobError::fatal(format!(
            "invalid configuration for {}: {e}",
            execution.job_type
        ))
    })
}
