//! Job definitions: shared kind and suspension state of a family of jobs.

use serde::{Deserialize, Serialize};

use jobflow_core::{Entity, EntityId, Revision, TenantId};

pub mod fields {
    pub const JOB_TYPE: &str = "job_type";
    pub const SUSPENDED: &str = "suspended";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: EntityId,
    #[serde(skip)]
    revision: Revision,
    pub job_type: String,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
}

impl JobDefinition {
    pub fn new(job_type: impl Into<String>, tenant_id: Option<TenantId>) -> Self {
        Self {
            id: EntityId::new(),
            revision: Revision::NEW,
            job_type: job_type.into(),
            suspended: false,
            tenant_id,
        }
    }
}

impl Entity for JobDefinition {
    const ENTITY_TYPE: &'static str = "job_definition";

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
