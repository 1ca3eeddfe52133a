use chrono::Utc;
use tracing::{debug, info};

use jobflow_jobs::batch::MONITOR_JOB_TYPE;
use jobflow_jobs::job::fields;
use jobflow_jobs::{Batch, Job, MonitorJobConfiguration, instant_after};

use crate::context::CommandContext;
use crate::error::JobError;
use crate::jobs::JobExecution;
use crate::store::{Criterion, RecordQuery};

use super::job_configuration;

/// Completes the batch once no seed or work jobs remain, otherwise polls again later.
pub fn execute(execution: &JobExecution, ctx: &mut CommandContext) -> Result<(), JobError> {
    let monitor: MonitorJobConfiguration = job_configuration(execution)?;
    let batch_id = monitor.batch_id;
    let config = ctx.config();
    let (poll_base, poll_max, retries) = (
        config.batch_poll_interval,
        config.max_batch_poll_interval,
        config.default_retries,
    );

    let Some(batch) = ctx.unit_of_work().find::<Batch>(batch_id)? else {
        debug!(batch_id = %batch_id, "monitor job of a deleted batch");
        return Ok(());
    };
    if batch.is_completed() {
        return Ok(());
    }

    let remaining = ctx.unit_of_work().count(
        &RecordQuery::of::<Job>().filter(Criterion::one_of(
            fields::JOB_DEFINITION_ID,
            [
                batch.seed_job_definition_id.to_string(),
                batch.work_job_definition_id.to_string(),
            ],
        )),
    )?;

    if remaining > 0 {
        let next = monitor.next();
        let due_date = instant_after(Utc::now(), next.poll_delay(poll_base, poll_max))
            .ok_or_else(|| JobError::fatal("batch poll interval overflows the monitor due date"))?;
        let configuration = serde_json::to_value(next).map_err(|e| JobError::fatal(e.to_string()))?;
        let next_monitor = Job::new(MONITOR_JOB_TYPE, configuration)
            .with_definition(batch.monitor_job_definition_id)
            .with_tenant(batch.tenant_id)
            .with_retries(retries)
            .suspended(batch.suspended)
            .with_due_date(due_date);
        debug!(batch_id = %batch_id, remaining, attempt = next.attempt, "batch still running");
        ctx.unit_of_work().register_insert(next_monitor);
        return Ok(());
    }

    if let Some(batch) = ctx.unit_of_work().get_or_load::<Batch>(batch_id)? {
        batch.complete(Utc::now());
        info!(batch_id = %batch_id, batch_type = %batch.batch_type, "batch completed");
    }
    Ok(())
}
