//! Job engine infrastructure: entity store, unit of work, operation
//! pipeline, job executor, batches and the management service.

pub mod batch;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod jobs;
pub mod management;
pub mod services;
pub mod store;
pub mod unit_of_work;

#[cfg(test)]
mod integration_tests;

pub use batch::{BatchHandlerRegistry, BatchJobHandler, CreateBatch, FnBatchHandler};
pub use config::{ConfigError, EngineConfig};
pub use context::{CommandContext, TransactionPhase};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use error::{EngineError, JobError};
pub use interceptor::{CommandExecutor, FnOperation, Interceptor, Invocation, Next, Operation};
pub use jobs::{ExecutorStats, JobExecution, JobExecutorHandle, JobHandlerRegistry};
pub use management::{BatchQuery, BatchStatistics, IncidentQuery, JobQuery, ManagementService};
pub use services::EngineServices;
pub use store::{EntityStore, InMemoryEntityStore, PostgresEntityStore, StoreError};
pub use unit_of_work::{FlushSummary, LockFailureResolution, UnitOfWork};
