use tracing::{debug, info};

use jobflow_jobs::batch::{SEED_JOB_TYPE, WORK_JOB_TYPE};
use jobflow_jobs::{Batch, Job, SeedJobConfiguration, WorkJobConfiguration};

use crate::context::CommandContext;
use crate::error::JobError;
use crate::jobs::JobExecution;

use super::job_configuration;

/// Creates the next slice of work jobs and, if targets remain, the next seed job.
pub fn execute(execution: &JobExecution, ctx: &mut CommandContext) -> Result<(), JobError> {
    let SeedJobConfiguration { batch_id } = job_configuration(execution)?;
    let retries = ctx.config().default_retries;

    let Some(batch) = ctx.unit_of_work().get_or_load::<Batch>(batch_id)? else {
        debug!(batch_id = %batch_id, "seed job of a deleted batch");
        return Ok(());
    };
    let plan = batch.plan_seed();
    batch.record_jobs_created(plan.chunks.len() as u32);
    let (definitions, tenant_id, suspended) = (batch.definitions(), batch.tenant_id, batch.suspended);
    let created = batch.jobs_created;

    let chunk_count = plan.chunks.len();
    for targets in plan.chunks {
        let configuration = serde_json::to_value(WorkJobConfiguration { batch_id, targets })
            .map_err(|e| JobError::fatal(e.to_string()))?;
        let work_job = Job::new(WORK_JOB_TYPE, configuration)
            .with_definition(definitions.work)
            .with_tenant(tenant_id)
            .with_retries(retries)
            .suspended(suspended);
        ctx.unit_of_work().register_insert(work_job);
    }

    if plan.has_remaining {
        let configuration = serde_json::to_value(SeedJobConfiguration { batch_id })
            .map_err(|e| JobError::fatal(e.to_string()))?;
        let next_seed = Job::new(SEED_JOB_TYPE, configuration)
            .with_definition(definitions.seed)
            .with_tenant(tenant_id)
            .with_retries(retries)
            .suspended(suspended);
        ctx.unit_of_work().register_insert(next_seed);
    }

    info!(
        batch_id = %batch_id,
        work_jobs = chunk_count,
        jobs_created = created,
        has_remaining = plan.has_remaining,
        "batch seed ran"
    );
    Ok(())
}
