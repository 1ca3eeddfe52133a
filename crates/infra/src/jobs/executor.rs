//! Job executor: one acquisition thread feeding a bounded worker pool.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use jobflow_core::EntityId;
use jobflow_jobs::FailureOutcome;

use crate::error::EngineError;
use crate::interceptor::CommandExecutor;

use super::acquisition::AcquireJobs;
use super::execution::{ExecuteJob, FailureReport, JobRun};
use super::pool::{Submission, WorkerPool};

/// Messages understood by the acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionSignal {
    Shutdown,
    /// A committed unit of work inserted jobs; acquire without waiting.
    JobsAdded,
}

/// Hint channel from committing contexts to the running executor.
///
/// Only the most recently started executor of an engine is attached.
#[derive(Clone, Default)]
pub struct JobSignal(Arc<Mutex<Option<Sender<AcquisitionSignal>>>>);

impl core::fmt::Debug for JobSignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobSignal")
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl JobSignal {
    pub fn attach(&self, sender: Sender<AcquisitionSignal>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    pub fn detach(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_attached(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn jobs_added(&self) {
        if let Some(sender) = self.0.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            let _ = sender.send(AcquisitionSignal::JobsAdded);
        }
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub acquisition_cycles: u64,
    pub jobs_acquired: u64,
    pub lost_races: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_exhausted: u64,
    /// Executions that lost an optimistic-lock conflict.
    pub jobs_conflicted: u64,
    /// Batches run on the acquisition thread because the queue was full.
    pub caller_runs: u64,
    pub store_errors: u64,
    pub uptime_secs: u64,
}

type SharedStats = Arc<Mutex<ExecutorStats>>;

fn update(stats: &SharedStats, f: impl FnOnce(&mut ExecutorStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: Sender<AcquisitionSignal>,
    join: Option<thread::JoinHandle<()>>,
    stats: SharedStats,
    signal: JobSignal,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for in-flight jobs.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.signal.detach();
        let _ = self.shutdown.send(AcquisitionSignal::Shutdown);
        if join.join().is_err() {
            warn!("job acquisition thread panicked");
        }
    }
}

impl Drop for JobExecutorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background job executor.
///
/// Acquires due jobs through the operation pipeline, dispatches them to a
/// worker pool and lets `ExecuteJob` handle success, retries and incidents.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    executor: CommandExecutor,
}

impl JobExecutor {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    /// Spawn the acquisition thread and its worker pool.
    pub fn spawn(self) -> Result<JobExecutorHandle, EngineError> {
        let config = self.executor.services().config.clone();
        let pool = WorkerPool::new(
            &config.engine_name,
            config.worker_pool_size,
            config.worker_queue_capacity,
        )
        .map_err(|e| EngineError::Internal(format!("failed to start worker pool: {e}")))?;

        let (sender, receiver) = mpsc::channel::<AcquisitionSignal>();
        let stats: SharedStats = Arc::new(Mutex::new(ExecutorStats::default()));
        let signal = self.executor.services().job_signal.clone();
        signal.attach(sender.clone());

        let stats_clone = stats.clone();
        let join = thread::Builder::new()
            .name(format!("{}-acquisition", config.engine_name))
            .spawn(move || acquisition_loop(self.executor, pool, receiver, stats_clone))
            .map_err(|e| {
                signal.detach();
                EngineError::Internal(format!("failed to spawn job executor thread: {e}"))
            })?;

        Ok(JobExecutorHandle {
            shutdown: sender,
            join: Some(join),
            stats,
            signal,
        })
    }
}

fn acquisition_loop(
    executor: CommandExecutor,
    mut pool: WorkerPool,
    signals: Receiver<AcquisitionSignal>,
    stats: SharedStats,
) {
    let config = executor.services().config.clone();
    info!(
        engine = %config.engine_name,
        owner = %config.lock_owner,
        workers = pool.size(),
        "job executor started"
    );
    let start_time = Instant::now();
    let mut backoff = config.acquisition_interval;

    loop {
        update(&stats, |s| {
            s.acquisition_cycles += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
        });

        let acquire = AcquireJobs::new(
            config.lock_owner.clone(),
            config.lock_duration,
            config.max_jobs_per_acquisition,
        );
        let wait = match executor.execute(acquire) {
            Ok(acquired) => {
                backoff = config.acquisition_interval;
                let acquired_count = acquired.job_count();
                let lost = acquired.lost.len();
                update(&stats, |s| {
                    s.jobs_acquired += acquired_count as u64;
                    s.lost_races += lost as u64;
                });
                if acquired_count > 0 {
                    debug!(owner = %config.lock_owner, acquired = acquired_count, lost, "acquired jobs");
                }

                for batch in acquired.batches {
                    dispatch(&pool, &executor, &config.lock_owner, batch, &stats);
                }

                if acquired_count + lost >= config.max_jobs_per_acquisition {
                    Duration::ZERO
                } else {
                    config.acquisition_interval
                }
            }
            Err(error) => {
                backoff = backoff.saturating_mul(2).min(config.max_acquisition_backoff);
                update(&stats, |s| s.store_errors += 1);
                warn!(
                    owner = %config.lock_owner,
                    error = %error,
                    retry_in_ms = backoff.as_millis() as u64,
                    "job acquisition failed"
                );
                backoff
            }
        };

        if !wait_for_signal(&signals, wait) {
            break;
        }
    }

    pool.shutdown();
    info!(engine = %config.engine_name, "job executor stopped");
}

/// Waits up to `wait`; returns `false` on shutdown.
fn wait_for_signal(signals: &Receiver<AcquisitionSignal>, wait: Duration) -> bool {
    let first = if wait.is_zero() {
        match signals.try_recv() {
            Ok(signal) => Some(signal),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => return false,
        }
    } else {
        match signals.recv_timeout(wait) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    };
    if first == Some(AcquisitionSignal::Shutdown) {
        return false;
    }

    // Collapse queued hints into a single cycle.
    while let Ok(signal) = signals.try_recv() {
        if signal == AcquisitionSignal::Shutdown {
            return false;
        }
    }
    true
}

fn dispatch(
    pool: &WorkerPool,
    executor: &CommandExecutor,
    owner: &str,
    batch: Vec<EntityId>,
    stats: &SharedStats,
) {
    let executor = executor.clone();
    let owner = owner.to_string();
    let task_stats = stats.clone();
    let submission = pool.submit(move || run_batch(&executor, &owner, batch, &task_stats));
    if submission == Submission::RanOnCaller {
        update(stats, |s| s.caller_runs += 1);
    }
}

fn run_batch(executor: &CommandExecutor, owner: &str, batch: Vec<EntityId>, stats: &SharedStats) {
    for job_id in batch {
        let report = FailureReport::default();
        let operation = ExecuteJob::new(job_id)
            .locked_by(owner)
            .reporting_to(report.clone());
        match executor.execute(operation) {
            Ok(JobRun::Succeeded) => update(stats, |s| s.jobs_succeeded += 1),
            Ok(JobRun::Skipped) => {}
            Err(error) if error.is_optimistic_lock() => {
                debug!(job_id = %job_id, error = %error, "job execution conflicted");
                update(stats, |s| s.jobs_conflicted += 1);
            }
            Err(error) => {
                let exhausted = report.outcome() == Some(FailureOutcome::Exhausted);
                debug!(job_id = %job_id, error = %error, exhausted, "job execution failed");
                update(stats, |s| {
                    s.jobs_failed += 1;
                    if exhausted {
                        s.jobs_exhausted += 1;
                    }
                });
            }
        }
    }
}
