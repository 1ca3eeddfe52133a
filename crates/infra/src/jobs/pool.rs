//! Bounded worker pool with caller-runs backpressure.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Where a submitted task ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// Queue full (or pool stopped): executed on the submitting thread.
    RanOnCaller,
}

/// Fixed set of worker threads fed through a bounded channel.
pub struct WorkerPool {
    sender: Option<SyncSender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("open", &self.sender.is_some())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(name: &str, size: usize, queue_capacity: usize) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Task>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(index, receiver))?;
            workers.push(worker);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue `task`, or run it right here if the queue is full.
    pub fn submit<F>(&self, task: F) -> Submission
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        let rejected = match &self.sender {
            Some(sender) => match sender.try_send(task) {
                Ok(()) => return Submission::Queued,
                Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => task,
            },
            None => task,
        };
        run_task(rejected);
        Submission::RanOnCaller
    }

    /// Stop accepting work, drain the queue and join every worker.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, receiver: Arc<Mutex<Receiver<Task>>>) {
    debug!(worker = index, "worker started");
    loop {
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        match next {
            Ok(task) => run_task(task),
            Err(_) => break,
        }
    }
    debug!(worker = index, "worker stopped");
}

fn run_task(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("task panicked");
    }
}
