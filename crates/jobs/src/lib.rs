//! Job, incident and batch entities.
//!
//! This crate holds the persisted shapes and the pure state transitions of the
//! scheduling substrate (no IO, no threads, no storage). The scheduler in
//! `jobflow-infra` drives these transitions inside units of work.

pub mod batch;
pub mod definition;
pub mod incident;
pub mod job;
pub mod retry;

pub use batch::{
    Batch, BatchConfiguration, BatchDefinitions, MonitorJobConfiguration, SeedJobConfiguration,
    SeedPlan, WorkJobConfiguration,
};
pub use definition::JobDefinition;
pub use incident::{Incident, IncidentType};
pub use job::{DEFAULT_RETRIES, FailureOutcome, Job, JobState, RetriesChange, instant_after};
pub use retry::{BackoffStrategy, RetryPolicy};
