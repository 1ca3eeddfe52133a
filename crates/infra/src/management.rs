//! Operator surface: query and steer jobs, incidents and batches.
//!
//! Every call runs as an operation through the pipeline on behalf of the
//! service's principal, so permission checks and tenant scoping apply the
//! same way they do for any other engine operation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use jobflow_auth::{Permission, Principal};
use jobflow_core::{EntityId, TenantId};
use jobflow_jobs::{Batch, Incident, IncidentType, Job, JobDefinition, RetriesChange};
use jobflow_jobs::{batch, incident, job};

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::interceptor::{CommandExecutor, FnOperation};
use crate::jobs::{ExecuteJob, JobRun};
use crate::store::{Criterion, RecordQuery};

/// Job filter; unset fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobQuery {
    pub job_id: Option<EntityId>,
    pub job_type: Option<String>,
    pub due_before: Option<DateTime<Utc>>,
    pub locked: Option<bool>,
    /// `Some(true)`: only jobs without retries left.
    pub exhausted: Option<bool>,
    pub job_definition_id: Option<EntityId>,
    pub associated_entity_id: Option<EntityId>,
    pub suspended: Option<bool>,
    pub with_exception: bool,
    pub tenant_id: Option<TenantId>,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn due_before(mut self, at: DateTime<Utc>) -> Self {
        self.due_before = Some(at);
        self
    }

    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = Some(locked);
        self
    }

    pub fn exhausted(mut self, exhausted: bool) -> Self {
        self.exhausted = Some(exhausted);
        self
    }

    pub fn job_definition(mut self, id: EntityId) -> Self {
        self.job_definition_id = Some(id);
        self
    }

    pub fn associated_entity(mut self, id: EntityId) -> Self {
        self.associated_entity_id = Some(id);
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = Some(suspended);
        self
    }

    pub fn with_exception(mut self) -> Self {
        self.with_exception = true;
        self
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn to_record_query(&self, now: DateTime<Utc>) -> RecordQuery {
        let now_ms = now.timestamp_millis();
        let mut query = RecordQuery::of::<Job>();
        if let Some(id) = self.job_id {
            query = query.filter(Criterion::eq("id", id.to_string()));
        }
        if let Some(job_type) = &self.job_type {
            query = query.filter(Criterion::eq(job::fields::JOB_TYPE, job_type.as_str()));
        }
        if let Some(at) = self.due_before {
            query = query.filter(Criterion::lt(job::fields::DUE_DATE, at.timestamp_millis()));
        }
        match self.locked {
            Some(true) => {
                query = query
                    .filter(Criterion::not_null(job::fields::LOCK_OWNER))
                    .filter(Criterion::ge(job::fields::LOCK_EXPIRATION, now_ms));
            }
            Some(false) => {
                query = query.filter(Criterion::any_of(vec![
                    Criterion::is_null(job::fields::LOCK_OWNER),
                    Criterion::lt(job::fields::LOCK_EXPIRATION, now_ms),
                ]));
            }
            None => {}
        }
        match self.exhausted {
            Some(true) => query = query.filter(Criterion::eq(job::fields::RETRIES, 0)),
            Some(false) => query = query.filter(Criterion::gt(job::fields::RETRIES, 0)),
            None => {}
        }
        if let Some(id) = self.job_definition_id {
            query = query.filter(Criterion::id_eq(job::fields::JOB_DEFINITION_ID, id));
        }
        if let Some(id) = self.associated_entity_id {
            query = query.filter(Criterion::id_eq(job::fields::ASSOCIATED_ENTITY_ID, id));
        }
        if let Some(suspended) = self.suspended {
            query = query.filter(Criterion::eq(job::fields::SUSPENDED, suspended));
        }
        if self.with_exception {
            query = query.filter(Criterion::not_null(job::fields::EXCEPTION_MESSAGE));
        }
        if let Some(tenant_id) = self.tenant_id {
            query = query.filter(Criterion::eq(job::fields::TENANT_ID, tenant_id.to_string()));
        }
        query = query
            .descending(job::fields::PRIORITY)
            .ascending_nulls_first(job::fields::DUE_DATE);
        match self.limit {
            Some(limit) => query.limit(limit),
            None => query,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentQuery {
    pub incident_type: Option<IncidentType>,
    pub job_id: Option<EntityId>,
    pub job_definition_id: Option<EntityId>,
    pub batch_id: Option<EntityId>,
    pub tenant_id: Option<TenantId>,
    pub limit: Option<usize>,
}

impl IncidentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incident_type(mut self, incident_type: IncidentType) -> Self {
        self.incident_type = Some(incident_type);
        self
    }

    pub fn job(mut self, job_id: EntityId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn batch(mut self, batch_id: EntityId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn to_record_query(&self) -> RecordQuery {
        let mut query = RecordQuery::of::<Incident>();
        if let Some(incident_type) = self.incident_type {
            query = query.filter(Criterion::eq(
                incident::fields::INCIDENT_TYPE,
                incident_type.as_str(),
            ));
        }
        if let Some(id) = self.job_id {
            query = query.filter(Criterion::id_eq(incident::fields::JOB_ID, id));
        }
        if let Some(id) = self.job_definition_id {
            query = query.filter(Criterion::id_eq(incident::fields::JOB_DEFINITION_ID, id));
        }
        if let Some(id) = self.batch_id {
            query = query.filter(Criterion::id_eq(incident::fields::BATCH_ID, id));
        }
        if let Some(tenant_id) = self.tenant_id {
            query = query.filter(Criterion::eq(incident::fields::TENANT_ID, tenant_id.to_string()));
        }
        query = query.ascending(incident::fields::CREATED_AT);
        match self.limit {
            Some(limit) => query.limit(limit),
            None => query,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchQuery {
    pub batch_type: Option<String>,
    pub completed: Option<bool>,
    pub suspended: Option<bool>,
    pub tenant_id: Option<TenantId>,
    pub limit: Option<usize>,
}

impl BatchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_type(mut self, batch_type: impl Into<String>) -> Self {
        self.batch_type = Some(batch_type.into());
        self
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = Some(suspended);
        self
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn to_record_query(&self) -> RecordQuery {
        let mut query = RecordQuery::of::<Batch>();
        if let Some(batch_type) = &self.batch_type {
            query = query.filter(Criterion::eq(batch::fields::BATCH_TYPE, batch_type.as_str()));
        }
        match self.completed {
            Some(true) => query = query.filter(Criterion::not_null(batch::fields::END_TIME)),
            Some(false) => query = query.filter(Criterion::is_null(batch::fields::END_TIME)),
            None => {}
        }
        if let Some(suspended) = self.suspended {
            query = query.filter(Criterion::eq(batch::fields::SUSPENDED, suspended));
        }
        if let Some(tenant_id) = self.tenant_id {
            query = query.filter(Criterion::eq(batch::fields::TENANT_ID, tenant_id.to_string()));
        }
        query = query.ascending(batch::fields::START_TIME);
        match self.limit {
            Some(limit) => query.limit(limit),
            None => query,
        }
    }
}

/// Progress of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatistics {
    pub batch_id: EntityId,
    pub batch_type: String,
    pub total_jobs: u32,
    pub jobs_created: u32,
    /// Seed and work jobs still stored (including failed ones).
    pub remaining_jobs: usize,
    /// Seed and work jobs without retries left.
    pub failed_jobs: usize,
    pub incidents: usize,
    pub completed: bool,
    pub suspended: bool,
}

/// Operator API, bound to the principal it acts for.
#[derive(Debug, Clone)]
pub struct ManagementService {
    executor: CommandExecutor,
    principal: Option<Principal>,
}

impl ManagementService {
    /// System-level service (no permission checks).
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            executor,
            principal: None,
        }
    }

    /// Same service acting for `principal`.
    pub fn with_principal(&self, principal: Principal) -> Self {
        Self {
            executor: self.executor.clone(),
            principal: Some(principal),
        }
    }

    fn run<T, F>(&self, name: &'static str, permission: Permission, body: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut CommandContext) -> Result<T, EngineError>,
    {
        let operation = FnOperation::new(name, body).requiring(vec![permission]);
        match &self.principal {
            Some(principal) => self.executor.execute_as(principal, operation),
            None => self.executor.execute(operation),
        }
    }

    fn tenant_scope(&self, field: &str) -> Option<Criterion> {
        let tenant_id = self.principal.as_ref()?.active_tenant_id?;
        Some(Criterion::any_of(vec![
            Criterion::is_null(field),
            Criterion::eq(field, tenant_id.to_string()),
        ]))
    }

    fn scoped(&self, query: RecordQuery, tenant_field: &str) -> RecordQuery {
        match self.tenant_scope(tenant_field) {
            Some(scope) => query.filter(scope),
            None => query,
        }
    }

    // ---- jobs ----

    pub fn job_query(&self, query: JobQuery) -> Result<Vec<Job>, EngineError> {
        let record_query = self.scoped(query.to_record_query(Utc::now()), job::fields::TENANT_ID);
        self.run("job_query", Permission::JOB_READ, move |ctx| {
            Ok(ctx.unit_of_work().query::<Job>(&record_query)?)
        })
    }

    pub fn job(&self, job_id: EntityId) -> Result<Option<Job>, EngineError> {
        self.run("job", Permission::JOB_READ, move |ctx| {
            let job = ctx.unit_of_work().find::<Job>(job_id)?;
            match job {
                Some(job) => {
                    ctx.check_tenant(job.tenant_id)?;
                    Ok(Some(job))
                }
                None => Ok(None),
            }
        })
    }

    /// Operator retry override. Giving an exhausted job retries back makes
    /// it due again and resolves its incident; setting zero opens one.
    pub fn set_job_retries(&self, job_id: EntityId, retries: u32) -> Result<(), EngineError> {
        self.run("set_job_retries", Permission::JOB_UPDATE, move |ctx| {
            let job = job_mut(ctx, job_id)?;
            let change = job.set_retries(retries);
            let snapshot = job.clone();

            match change {
                RetriesChange::Restored => {
                    let incidents = ctx.unit_of_work().query::<Incident>(
                        &IncidentQuery::new()
                            .job(job_id)
                            .incident_type(IncidentType::FailedJob)
                            .to_record_query(),
                    )?;
                    for incident in incidents {
                        ctx.unit_of_work().register_delete::<Incident>(incident.id)?;
                    }
                    info!(job_id = %job_id, retries, "job retries restored");
                }
                RetriesChange::Exhausted => {
                    ctx.unit_of_work()
                        .register_insert(Incident::failed_job(&snapshot));
                    info!(job_id = %job_id, "job retries cleared");
                }
                RetriesChange::Unchanged => {}
            }
            Ok(())
        })
    }

    /// `None` makes the job due immediately.
    pub fn set_job_due_date(
        &self,
        job_id: EntityId,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        self.run("set_job_due_date", Permission::JOB_UPDATE, move |ctx| {
            job_mut(ctx, job_id)?.due_date = due_date;
            Ok(())
        })
    }

    pub fn set_job_priority(&self, job_id: EntityId, priority: i64) -> Result<(), EngineError> {
        self.run("set_job_priority", Permission::JOB_UPDATE, move |ctx| {
            job_mut(ctx, job_id)?.priority = priority;
            Ok(())
        })
    }

    pub fn suspend_job(&self, job_id: EntityId) -> Result<(), EngineError> {
        self.run("suspend_job", Permission::JOB_UPDATE, move |ctx| {
            job_mut(ctx, job_id)?.suspended = true;
            Ok(())
        })
    }

    pub fn activate_job(&self, job_id: EntityId) -> Result<(), EngineError> {
        self.run("activate_job", Permission::JOB_UPDATE, move |ctx| {
            job_mut(ctx, job_id)?.suspended = false;
            Ok(())
        })
    }

    /// Deletes the job and its incidents.
    pub fn delete_job(&self, job_id: EntityId) -> Result<(), EngineError> {
        self.run("delete_job", Permission::JOB_DELETE, move |ctx| {
            job_mut(ctx, job_id)?;
            ctx.unit_of_work().register_delete::<Job>(job_id)?;
            let incidents = ctx
                .unit_of_work()
                .query::<Incident>(&IncidentQuery::new().job(job_id).to_record_query())?;
            for incident in incidents {
                ctx.unit_of_work().register_delete::<Incident>(incident.id)?;
            }
            Ok(())
        })
    }

    /// Runs the job now, with the same failure handling as the executor.
    pub fn execute_job(&self, job_id: EntityId) -> Result<JobRun, EngineError> {
        self.run("execute_job_now", Permission::JOB_UPDATE, move |ctx| {
            job_mut(ctx, job_id)?;
            ctx.requires_new(ExecuteJob::new(job_id))
        })
    }

    // ---- incidents ----

    pub fn incident_query(&self, query: IncidentQuery) -> Result<Vec<Incident>, EngineError> {
        let record_query = self.scoped(query.to_record_query(), incident::fields::TENANT_ID);
        self.run("incident_query", Permission::INCIDENT_READ, move |ctx| {
            Ok(ctx.unit_of_work().query::<Incident>(&record_query)?)
        })
    }

    // ---- batches ----

    pub fn batch(&self, batch_id: EntityId) -> Result<Option<Batch>, EngineError> {
        self.run("batch", Permission::BATCH_READ, move |ctx| {
            match ctx.unit_of_work().find::<Batch>(batch_id)? {
                Some(batch) => {
                    ctx.check_tenant(batch.tenant_id)?;
                    Ok(Some(batch))
                }
                None => Ok(None),
            }
        })
    }

    pub fn batch_query(&self, query: BatchQuery) -> Result<Vec<Batch>, EngineError> {
        let record_query = self.scoped(query.to_record_query(), batch::fields::TENANT_ID);
        self.run("batch_query", Permission::BATCH_READ, move |ctx| {
            Ok(ctx.unit_of_work().query::<Batch>(&record_query)?)
        })
    }

    pub fn batch_statistics(&self, batch_id: EntityId) -> Result<BatchStatistics, EngineError> {
        self.run("batch_statistics", Permission::BATCH_READ, move |ctx| {
            let batch = batch_mut(ctx, batch_id)?.clone();
            let execution_jobs = || {
                RecordQuery::of::<Job>().filter(Criterion::one_of(
                    job::fields::JOB_DEFINITION_ID,
                    [
                        batch.seed_job_definition_id.to_string(),
                        batch.work_job_definition_id.to_string(),
                    ],
                ))
            };
            let uow = ctx.unit_of_work();
            let remaining_jobs = uow.count(&execution_jobs())?;
            let failed_jobs =
                uow.count(&execution_jobs().filter(Criterion::eq(job::fields::RETRIES, 0)))?;
            let incidents = uow.count(&batch_incidents(&batch))?;

            Ok(BatchStatistics {
                batch_id,
                batch_type: batch.batch_type.clone(),
                total_jobs: batch.total_jobs,
                jobs_created: batch.jobs_created,
                remaining_jobs,
                failed_jobs,
                incidents,
                completed: batch.is_completed(),
                suspended: batch.suspended,
            })
        })
    }

    /// Deletes the batch row; `cascade` also removes its job definitions,
    /// jobs and incidents.
    pub fn delete_batch(&self, batch_id: EntityId, cascade: bool) -> Result<(), EngineError> {
        self.run("delete_batch", Permission::BATCH_DELETE, move |ctx| {
            let batch = batch_mut(ctx, batch_id)?.clone();
            ctx.unit_of_work().register_delete::<Batch>(batch_id)?;
            if !cascade {
                return Ok(());
            }

            let jobs = ctx.unit_of_work().query::<Job>(&batch_jobs(&batch))?;
            let incidents = ctx.unit_of_work().query::<Incident>(&batch_incidents(&batch))?;
            let uow = ctx.unit_of_work();
            for job in &jobs {
                uow.register_delete::<Job>(job.id)?;
            }
            for incident in &incidents {
                uow.register_delete::<Incident>(incident.id)?;
            }
            for definition_id in definition_ids(&batch) {
                uow.register_delete::<JobDefinition>(definition_id)?;
            }
            info!(batch_id = %batch_id, jobs = jobs.len(), incidents = incidents.len(), "batch deleted");
            Ok(())
        })
    }

    pub fn suspend_batch(&self, batch_id: EntityId) -> Result<(), EngineError> {
        self.run("suspend_batch", Permission::BATCH_UPDATE, move |ctx| {
            set_batch_suspended(ctx, batch_id, true)
        })
    }

    pub fn activate_batch(&self, batch_id: EntityId) -> Result<(), EngineError> {
        self.run("activate_batch", Permission::BATCH_UPDATE, move |ctx| {
            set_batch_suspended(ctx, batch_id, false)
        })
    }
}

fn job_mut(ctx: &mut CommandContext, job_id: EntityId) -> Result<&mut Job, EngineError> {
    let tenant_id = match ctx.unit_of_work().get_or_load::<Job>(job_id)? {
        Some(job) => job.tenant_id,
        None => return Err(EngineError::not_found(format!("job {job_id}"))),
    };
    ctx.check_tenant(tenant_id)?;
    ctx.unit_of_work()
        .get_or_load::<Job>(job_id)?
        .ok_or_else(|| EngineError::not_found(format!("job {job_id}")))
}

fn batch_mut(ctx: &mut CommandContext, batch_id: EntityId) -> Result<&mut Batch, EngineError> {
    let tenant_id = match ctx.unit_of_work().get_or_load::<Batch>(batch_id)? {
        Some(batch) => batch.tenant_id,
        None => return Err(EngineError::not_found(format!("batch {batch_id}"))),
    };
    ctx.check_tenant(tenant_id)?;
    ctx.unit_of_work()
        .get_or_load::<Batch>(batch_id)?
        .ok_or_else(|| EngineError::not_found(format!("batch {batch_id}")))
}

fn definition_ids(batch: &Batch) -> [EntityId; 3] {
    [
        batch.seed_job_definition_id,
        batch.monitor_job_definition_id,
        batch.work_job_definition_id,
    ]
}

/// Seed, monitor and work jobs of the batch.
fn batch_jobs(batch: &Batch) -> RecordQuery {
    RecordQuery::of::<Job>().filter(Criterion::one_of(
        job::fields::JOB_DEFINITION_ID,
        definition_ids(batch).map(|id| id.to_string()),
    ))
}

/// Failed invocations plus exhausted seed/monitor/work jobs.
fn batch_incidents(batch: &Batch) -> RecordQuery {
    RecordQuery::of::<Incident>().filter(Criterion::any_of(vec![
        Criterion::id_eq(incident::fields::BATCH_ID, batch.id),
        Criterion::one_of(
            incident::fields::JOB_DEFINITION_ID,
            definition_ids(batch).map(|id| id.to_string()),
        ),
    ]))
}

fn set_batch_suspended(
    ctx: &mut CommandContext,
    batch_id: EntityId,
    suspended: bool,
) -> Result<(), EngineError> {
    let batch = batch_mut(ctx, batch_id)?;
    batch.suspended = suspended;
    let batch = batch.clone();

    for definition_id in definition_ids(&batch) {
        if let Some(definition) = ctx.unit_of_work().get_or_load::<JobDefinition>(definition_id)? {
            definition.suspended = suspended;
        }
    }
    let jobs = ctx.unit_of_work().query::<Job>(&batch_jobs(&batch))?;
    for job in jobs {
        if let Some(job) = ctx.unit_of_work().get_or_load::<Job>(job.id)? {
            job.suspended = suspended;
        }
    }
    info!(batch_id = %batch_id, suspended, "batch suspension changed");
    Ok(())
}
