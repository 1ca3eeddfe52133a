use chrono::Utc;
use tracing::info;

use jobflow_auth::Permission;
use jobflow_core::TenantId;
use jobflow_jobs::batch::{MONITOR_JOB_TYPE, SEED_JOB_TYPE, WORK_JOB_TYPE};
use jobflow_jobs::{
    Batch, BatchConfiguration, BatchDefinitions, Job, JobDefinition, MonitorJobConfiguration,
    SeedJobConfiguration, instant_after,
};

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::interceptor::Operation;

/// Starts a batch: definitions, batch row, first seed job and first monitor job.
#[derive(Debug, Clone)]
pub struct CreateBatch {
    pub batch_type: String,
    pub configuration: BatchConfiguration,
    /// Defaults to the principal's active tenant.
    pub tenant_id: Option<TenantId>,
    /// Override of `jobs_per_seed_invocation`.
    pub jobs_per_seed: Option<u32>,
    /// Override of `invocations_per_batch_job`.
    pub invocations_per_job: Option<u32>,
}

impl CreateBatch {
    pub fn new(batch_type: impl Into<String>, configuration: BatchConfiguration) -> Self {
        Self {
            batch_type: batch_type.into(),
            configuration,
            tenant_id: None,
            jobs_per_seed: None,
            invocations_per_job: None,
        }
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_sizes(mut self, jobs_per_seed: u32, invocations_per_job: u32) -> Self {
        self.jobs_per_seed = Some(jobs_per_seed);
        self.invocations_per_job = Some(invocations_per_job);
        self
    }
}

impl Operation for CreateBatch {
    type Output = Batch;

    fn name(&self) -> &str {
        "create_batch"
    }

    fn required_permissions(&self) -> Vec<Permission> {
        vec![Permission::BATCH_CREATE]
    }

    fn execute(&mut self, ctx: &mut CommandContext) -> Result<Batch, EngineError> {
        if !ctx.services().batch_handlers.contains(&self.batch_type) {
            return Err(EngineError::validation(format!(
                "no batch handler registered for '{}'",
                self.batch_type
            )));
        }

        let tenant_id = self
            .tenant_id
            .or_else(|| ctx.principal().and_then(|p| p.active_tenant_id));
        ctx.check_tenant(tenant_id)?;

        let config = ctx.config();
        let jobs_per_seed = self.jobs_per_seed.unwrap_or(config.jobs_per_seed_invocation);
        let invocations_per_job = self
            .invocations_per_job
            .unwrap_or(config.invocations_per_batch_job);
        let retries = config.default_retries;
        let (poll_base, poll_max) = (config.batch_poll_interval, config.max_batch_poll_interval);

        let seed_definition = JobDefinition::new(SEED_JOB_TYPE, tenant_id);
        let monitor_definition = JobDefinition::new(MONITOR_JOB_TYPE, tenant_id);
        let work_definition = JobDefinition::new(WORK_JOB_TYPE, tenant_id);
        let definitions = BatchDefinitions {
            seed: seed_definition.id,
            monitor: monitor_definition.id,
            work: work_definition.id,
        };

        let batch = Batch::new(
            self.batch_type.clone(),
            self.configuration.clone(),
            definitions,
            jobs_per_seed,
            invocations_per_job,
        )?
        .with_tenant(tenant_id)
        .created_by(ctx.principal().map(|p| p.principal_id.to_string()));

        let seed_job = Job::new(
            SEED_JOB_TYPE,
            serde_json::to_value(SeedJobConfiguration { batch_id: batch.id })?,
        )
        .with_definition(definitions.seed)
        .with_tenant(tenant_id)
        .with_retries(retries);

        let monitor = MonitorJobConfiguration::first(batch.id);
        let first_poll = instant_after(Utc::now(), monitor.poll_delay(poll_base, poll_max))
            .ok_or_else(|| EngineError::validation("batch poll interval overflows the monitor due date"))?;
        let monitor_job = Job::new(MONITOR_JOB_TYPE, serde_json::to_value(monitor)?)
            .with_definition(definitions.monitor)
            .with_tenant(tenant_id)
            .with_retries(retries)
            .with_due_date(first_poll);

        info!(
            batch_id = %batch.id,
            batch_type = %batch.batch_type,
            targets = batch.configuration.targets.len(),
            total_jobs = batch.total_jobs,
            "batch created"
        );

        let uow = ctx.unit_of_work();
        uow.register_insert(seed_definition);
        uow.register_insert(monitor_definition);
        uow.register_insert(work_definition);
        uow.register_insert(batch.clone());
        uow.register_insert(seed_job);
        uow.register_insert(monitor_job);
        Ok(batch)
    }
}
