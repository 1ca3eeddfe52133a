//! Job scheduler.
//!
//! - `handler`: job-type -> handler registry (exact, `prefix.*`, `*`)
//! - `acquisition`: the `AcquireJobs` operation (select, defer, lock)
//! - `execution`: the `ExecuteJob` operation and its rollback hook
//! - `failure`: the `HandleJobFailure` operation (retry or exhaust)
//! - `pool`: bounded worker pool with caller-runs backpressure
//! - `executor`: the acquisition thread tying it all together

pub mod acquisition;
pub mod execution;
pub mod executor;
pub mod failure;
pub mod handler;
pub mod pool;

pub use acquisition::{AcquireJobs, AcquiredJobs};
pub use execution::{ExecuteJob, FailureReport, JobRun};
pub use executor::{AcquisitionSignal, ExecutorStats, JobExecutor, JobExecutorHandle, JobSignal};
pub use failure::HandleJobFailure;
pub use handler::{JobExecution, JobHandler, JobHandlerRegistry};
pub use pool::{Submission, WorkerPool};
