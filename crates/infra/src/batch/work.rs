use tracing::{debug, warn};

use jobflow_jobs::{Batch, Incident, Job, WorkJobConfiguration};

use crate::context::CommandContext;
use crate::error::JobError;
use crate::jobs::JobExecution;

use super::job_configuration;

/// Applies the batch handler to each target of the work job.
///
/// A failing target becomes a `FailedBatchInvocation` incident; the job
/// itself still succeeds.
pub fn execute(execution: &JobExecution, ctx: &mut CommandContext) -> Result<(), JobError> {
    let WorkJobConfiguration { batch_id, targets } = job_configuration(execution)?;

    let Some(batch) = ctx.unit_of_work().find::<Batch>(batch_id)? else {
        debug!(batch_id = %batch_id, "work job of a deleted batch");
        return Ok(());
    };
    let Some(job) = ctx.unit_of_work().find::<Job>(execution.job_id)? else {
        return Ok(());
    };
    let handler = ctx
        .services()
        .batch_handlers
        .get(&batch.batch_type)
        .ok_or_else(|| JobError::fatal(format!("no batch handler for '{}'", batch.batch_type)))?;

    let payload = &batch.configuration.payload;
    let mut failed = 0usize;
    for target in &targets {
        if let Err(error) = handler.execute(target, payload, ctx) {
            failed += 1;
            warn!(
                batch_id = %batch_id,
                job_id = %job.id,
                target = %target,
                error = %error,
                "batch invocation failed"
            );
            let incident = Incident::failed_batch_invocation(&job, batch_id, target, error.message());
            ctx.unit_of_work().register_insert(incident);
        }
    }

    debug!(batch_id = %batch_id, targets = targets.len(), failed, "batch work job ran");
    Ok(())
}
