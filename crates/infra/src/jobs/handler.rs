use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use jobflow_core::{EntityId, TenantId};
use jobflow_jobs::Job;

use crate::context::CommandContext;
use crate::error::{EngineError, JobError};
use crate::store::StoreError;

/// What a handler sees of the job it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobExecution {
    pub job_id: EntityId,
    pub job_type: String,
    pub configuration: JsonValue,
    pub retries: u32,
    pub associated_entity_id: Option<EntityId>,
    pub job_definition_id: Option<EntityId>,
    pub tenant_id: Option<TenantId>,
}

impl From<&Job> for JobExecution {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            configuration: job.configuration.clone(),
            retries: job.retries,
            associated_entity_id: job.associated_entity_id,
            job_definition_id: job.job_definition_id,
            tenant_id: job.tenant_id,
        }
    }
}

impl From<StoreError> for JobError {
    fn from(value: StoreError) -> Self {
        JobError::Retryable(value.to_string())
    }
}

impl From<EngineError> for JobError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::Job(inner) => inner,
            other => JobError::Retryable(other.to_string()),
        }
    }
}

/// Job handler function type.
pub type JobHandler =
    Arc<dyn Fn(&JobExecution, &mut CommandContext) -> Result<(), JobError> + Send + Sync>;

/// Handlers keyed by job-type pattern.
#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl core::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_list().entries(patterns).finish()
    }
}

impl JobHandlerRegistry {
    /// Register a handler for a job type, a `category.*` pattern or `*`.
    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JobExecution, &mut CommandContext) -> Result<(), JobError> + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    /// Adds every handler of `other`, replacing handlers with the same pattern.
    pub fn extend(&mut self, other: JobHandlerRegistry) {
        self.handlers.extend(other.handlers);
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.handlers.contains_key(pattern)
    }

    /// Handler for `job_type`.
    pub fn get(&self, job_type: &str) -> Option<&JobHandler> {
        // Try exact match first
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h);
        }

        // Try category match (e.g., "batch.*" matches "batch.seed"); longest prefix wins
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);
        if category.is_some() {
            return category;
        }

        // Try wildcard
        self.handlers.get("*")
    }
}
