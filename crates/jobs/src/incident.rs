//! Incidents: durable, operator-visible failure records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobflow_core::{Entity, EntityId, Revision, TenantId};

use crate::job::Job;

pub mod fields {
    pub const INCIDENT_TYPE: &str = "incident_type";
    pub const JOB_ID: &str = "job_id";
    pub const JOB_DEFINITION_ID: &str = "job_definition_id";
    pub const BATCH_ID: &str = "batch_id";
    pub const TENANT_ID: &str = "tenant_id";
    pub const CREATED_AT: &str = "created_at";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    /// A job ran out of retries.
    FailedJob,
    /// A single target of a batch work job failed.
    FailedBatchInvocation,
}

impl IncidentType {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentType::FailedJob => "failed_job",
            IncidentType::FailedBatchInvocation => "failed_batch_invocation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: EntityId,
    #[serde(skip)]
    revision: Revision,
    pub incident_type: IncidentType,
    #[serde(default)]
    pub job_id: Option<EntityId>,
    #[serde(default)]
    pub job_definition_id: Option<EntityId>,
    #[serde(default)]
    pub batch_id: Option<EntityId>,
    #[serde(default)]
    pub associated_entity_id: Option<EntityId>,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    pub message: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Incident {
    /// Incident for a job that exhausted its retries.
    pub fn failed_job(job: &Job) -> Self {
        Self {
            id: EntityId::new(),
            revision: Revision::NEW,
            incident_type: IncidentType::FailedJob,
            job_id: Some(job.id),
            job_definition_id: job.job_definition_id,
            batch_id: None,
            associated_entity_id: job.associated_entity_id,
            tenant_id: job.tenant_id,
            message: job
                .exception_message
                .clone()
                .unwrap_or_else(|| "retries exhausted".to_string()),
            created_at: Utc::now(),
        }
    }

    /// Incident for one failed target of a batch work job.
    pub fn failed_batch_invocation(
        job: &Job,
        batch_id: EntityId,
        target: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: EntityId::new(),
            revision: Revision::NEW,
            incident_type: IncidentType::FailedBatchInvocation,
            job_id: Some(job.id),
            job_definition_id: job.job_definition_id,
            batch_id: Some(batch_id),
            associated_entity_id: None,
            tenant_id: job.tenant_id,
            message: format!("target {target}: {}", message.into()),
            created_at: Utc::now(),
        }
    }
}

impl Entity for Incident {
    const ENTITY_TYPE: &'static str = "incident";

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use serde_json::json;

    #[test]
    fn failed_job_incident_carries_failure_detail() {
        let entity = EntityId::new();
        let mut job = Job::new("invoice.post", json!({})).exclusive_for(entity).with_retries(1);
        job.fail("ledger closed", true, &RetryPolicy::immediate(), Utc::now());

        let incident = Incident::failed_job(&job);

        assert_eq!(incident.incident_type, IncidentType::FailedJob);
        assert_eq!(incident.job_id, Some(job.id));
        assert_eq!(incident.associated_entity_id, Some(entity));
        assert_eq!(incident.message, "ledger closed");
    }

    #[test]
    fn incident_type_serializes_as_snake_case() {
        let value = serde_json::to_value(IncidentType::FailedBatchInvocation).unwrap();
        assert_eq!(value, json!(IncidentType::FailedBatchInvocation.as_str()));
    }
}
