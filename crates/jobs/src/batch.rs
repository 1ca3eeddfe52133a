//! Batches: bulk operations split into seed, work and monitor jobs.
//!
//! A batch owns a list of targets. Its seed job turns a bounded slice of the
//! targets into work jobs per invocation (re-queuing itself while targets
//! remain), work jobs apply the batch handler to their targets, and the monitor
//! job polls until no seed or work job is left and then stamps the end time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobflow_core::{DomainError, DomainResult, Entity, EntityId, Revision, TenantId};

pub const SEED_JOB_TYPE: &str = "batch.seed";
pub const MONITOR_JOB_TYPE: &str = "batch.monitor";
pub const WORK_JOB_TYPE: &str = "batch.work";

pub mod fields {
    pub const BATCH_TYPE: &str = "batch_type";
    pub const TENANT_ID: &str = "tenant_id";
    pub const END_TIME: &str = "end_time";
    pub const SUSPENDED: &str = "suspended";
    pub const START_TIME: &str = "start_time";
}

/// What a batch operates on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchConfiguration {
    pub targets: Vec<String>,
    #[serde(default)]
    pub payload: JsonValue,
}

impl BatchConfiguration {
    pub fn new(targets: Vec<String>, payload: JsonValue) -> Self {
        Self { targets, payload }
    }
}

/// Ids of the three job definitions a batch runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDefinitions {
    pub seed: EntityId,
    pub monitor: EntityId,
    pub work: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: EntityId,
    #[serde(skip)]
    revision: Revision,
    pub batch_type: String,
    pub seed_job_definition_id: EntityId,
    pub monitor_job_definition_id: EntityId,
    pub work_job_definition_id: EntityId,
    pub total_jobs: u32,
    pub jobs_created: u32,
    pub jobs_per_seed: u32,
    pub invocations_per_job: u32,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub suspended: bool,
    pub configuration: BatchConfiguration,
}

/// Work a single seed invocation should create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPlan {
    /// One entry per work job, each holding that job's targets.
    pub chunks: Vec<Vec<String>>,
    /// Targets are left after this invocation; another seed job is needed.
    pub has_remaining: bool,
}

impl Batch {
    pub fn new(
        batch_type: impl Into<String>,
        configuration: BatchConfiguration,
        definitions: BatchDefinitions,
        jobs_per_seed: u32,
        invocations_per_job: u32,
    ) -> DomainResult<Self> {
        if jobs_per_seed == 0 {
            return Err(DomainError::validation("jobs per seed invocation must be positive"));
        }
        if invocations_per_job == 0 {
            return Err(DomainError::validation("invocations per batch job must be positive"));
        }

        let targets = configuration.targets.len() as u32;
        Ok(Self {
            id: EntityId::new(),
            revision: Revision::NEW,
            batch_type: batch_type.into(),
            seed_job_definition_id: definitions.seed,
            monitor_job_definition_id: definitions.monitor,
            work_job_definition_id: definitions.work,
            total_jobs: targets.div_ceil(invocations_per_job),
            jobs_created: 0,
            jobs_per_seed,
            invocations_per_job,
            tenant_id: None,
            created_by: None,
            start_time: Utc::now(),
            end_time: None,
            suspended: false,
            configuration,
        })
    }

    pub fn with_tenant(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn created_by(mut self, principal: Option<String>) -> Self {
        self.created_by = principal;
        self
    }

    pub fn definitions(&self) -> BatchDefinitions {
        BatchDefinitions {
            seed: self.seed_job_definition_id,
            monitor: self.monitor_job_definition_id,
            work: self.work_job_definition_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.end_time.is_some()
    }

    /// Targets not yet handed to a work job.
    pub fn remaining_targets(&self) -> usize {
        let consumed = self.jobs_created as usize * self.invocations_per_job as usize;
        self.configuration.targets.len().saturating_sub(consumed)
    }

    /// Next slice of work jobs, starting after the jobs already created.
    pub fn plan_seed(&self) -> SeedPlan {
        let per_job = self.invocations_per_job.max(1) as usize;
        let start = (self.jobs_created as usize * per_job).min(self.configuration.targets.len());
        let pending = &self.configuration.targets[start..];

        let chunks: Vec<Vec<String>> = pending
            .chunks(per_job)
            .take(self.jobs_per_seed.max(1) as usize)
            .map(|chunk| chunk.to_vec())
            .collect();
        let consumed: usize = chunks.iter().map(Vec::len).sum();

        SeedPlan {
            has_remaining: consumed < pending.len(),
            chunks,
        }
    }

    pub fn record_jobs_created(&mut self, count: u32) {
        self.jobs_created = self.jobs_created.saturating_add(count);
    }

    pub fn complete(&mut self, at: DateTime<Utc>) {
        if self.end_time.is_none() {
            self.end_time = Some(at);
        }
    }
}

impl Entity for Batch {
    const ENTITY_TYPE: &'static str = "batch";

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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedJobConfiguration {
    pub batch_id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkJobConfiguration {
    pub batch_id: EntityId,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorJobConfiguration {
    pub batch_id: EntityId,
    #[serde(default)]
    pub attempt: u32,
}

impl MonitorJobConfiguration {
    pub fn first(batch_id: EntityId) -> Self {
        Self {
            batch_id,
            attempt: 0,
        }
    }

    pub fn next(self) -> Self {
        Self {
            batch_id: self.batch_id,
            attempt: self.attempt.saturating_add(1),
        }
    }

    /// `base * 2^attempt`, capped at `max`.
    pub fn poll_delay(&self, base: Duration, max: Duration) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        base.checked_mul(factor).unwrap_or(max).min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definitions() -> BatchDefinitions {
        BatchDefinitions {
            seed: EntityId::new(),
            monitor: EntityId::new(),
            work: EntityId::new(),
        }
    }

    fn targets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("target-{i}")).collect()
    }

    #[test]
    fn thousand_targets_fit_one_seed_invocation() {
        let config = BatchConfiguration::new(targets(1000), json!({}));
        let batch = Batch::new("reindex", config, definitions(), 100, 100).unwrap();

        let plan = batch.plan_seed();

        assert_eq!(batch.total_jobs, 10);
        assert_eq!(plan.chunks.len(), 10);
        assert!(plan.chunks.iter().all(|c| c.len() == 100));
        assert!(!plan.has_remaining);
    }

    #[test]
    fn seed_plans_continue_where_previous_invocation_stopped() {
        let config = BatchConfiguration::new(targets(250), JsonValue::Null);
        let mut batch = Batch::new("reindex", config, definitions(), 2, 100).unwrap();

        let first = batch.plan_seed();
        assert_eq!(first.chunks.len(), 2);
        assert!(first.has_remaining);
        batch.record_jobs_created(first.chunks.len() as u32);

        let second = batch.plan_seed();
        assert_eq!(second.chunks, vec![targets(250)[200..].to_vec()]);
        assert!(!second.has_remaining);
        assert_eq!(batch.remaining_targets(), 50);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let config = BatchConfiguration::default();
        assert!(Batch::new("x", config.clone(), definitions(), 0, 1).is_err());
        assert!(Batch::new("x", config, definitions(), 1, 0).is_err());
    }

    #[test]
    fn empty_batch_plans_nothing() {
        let batch = Batch::new("x", BatchConfiguration::default(), definitions(), 5, 5).unwrap();
        let plan = batch.plan_seed();
        assert!(plan.chunks.is_empty());
        assert!(!plan.has_remaining);
        assert_eq!(batch.total_jobs, 0);
    }

    #[test]
    fn completion_is_stamped_once() {
        let mut batch = Batch::new("x", BatchConfiguration::default(), definitions(), 1, 1).unwrap();
        let first = Utc::now();
        batch.complete(first);
        batch.complete(first + chrono::Duration::seconds(5));
        assert_eq!(batch.end_time, Some(first));
        assert!(batch.is_completed());
    }

    #[test]
    fn monitor_poll_delay_doubles_up_to_cap() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        let mut monitor = MonitorJobConfiguration::first(EntityId::new());

        assert_eq!(monitor.poll_delay(base, max), Duration::from_secs(30));
        monitor = monitor.next();
        assert_eq!(monitor.poll_delay(base, max), Duration::from_secs(60));
        for _ in 0..40 {
            monitor = monitor.next();
        }
        assert_eq!(monitor.poll_delay(base, max), max);
    }
}
