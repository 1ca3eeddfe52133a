//! Engine assembly.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use jobflow_auth::Principal;
use jobflow_jobs::Batch;

use crate::batch::{self, BatchHandlerRegistry, BatchJobHandler, CreateBatch};
use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::error::{EngineError, JobError};
use crate::interceptor::{CommandExecutor, Interceptor};
use crate::jobs::{JobExecution, JobExecutor, JobExecutorHandle, JobHandlerRegistry};
use crate::management::ManagementService;
use crate::services::EngineServices;
use crate::store::EntityStore;

pub struct ProcessEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn EntityStore>>,
    job_handlers: JobHandlerRegistry,
    batch_handlers: BatchHandlerRegistry,
    interceptors: Option<Vec<Arc<dyn Interceptor>>>,
    init_logging: bool,
}

impl ProcessEngineBuilder {
    pub fn store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a job handler for a job type, a `category.*` pattern or `*`.
    pub fn handler<F>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JobExecution, &mut CommandContext) -> Result<(), JobError> + Send + Sync + 'static,
    {
        self.job_handlers.register(pattern, handler);
        self
    }

    pub fn batch_handler<H: BatchJobHandler + 'static>(mut self, handler: H) -> Self {
        self.batch_handlers.register(handler);
        self
    }

    /// Replace the standard interceptor chain.
    pub fn interceptors(mut self, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        self.interceptors = Some(interceptors);
        self
    }

    /// Install the tracing subscriber described by `config.log` on build.
    pub fn with_logging(mut self) -> Self {
        self.init_logging = true;
        self
    }

    pub fn build(self) -> Result<ProcessEngine, EngineError> {
        self.config
            .validate()
            .map_err(|e| EngineError::validation(e.to_string()))?;
        let store = self
            .store
            .ok_or_else(|| EngineError::validation("no entity store configured"))?;

        if self.init_logging {
            jobflow_observability::init(&self.config.log);
        }

        // User handlers win over the built-in batch handlers.
        let mut job_handlers = JobHandlerRegistry::default();
        batch::register_job_handlers(&mut job_handlers);
        job_handlers.extend(self.job_handlers);

        let auto_start = self.config.executor_auto_start;
        let services = EngineServices::new(store, self.config)
            .with_job_handlers(job_handlers)
            .with_batch_handlers(self.batch_handlers);
        let services = Arc::new(services);
        let executor = match self.interceptors {
            Some(interceptors) => CommandExecutor::new(services, interceptors),
            None => CommandExecutor::standard(services),
        };

        let engine = ProcessEngine {
            executor,
            auto_started: Mutex::new(None),
        };
        info!(
            engine = %engine.config().engine_name,
            owner = %engine.config().lock_owner,
            "process engine built"
        );

        if auto_start {
            let handle = engine.start_job_executor()?;
            *engine
                .auto_started
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
        Ok(engine)
    }
}

/// A configured engine: operation pipeline, management API and job executor.
pub struct ProcessEngine {
    executor: CommandExecutor,
    auto_started: Mutex<Option<JobExecutorHandle>>,
}

impl core::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("executor", &self.executor)
            .field("services", self.executor.services())
            .finish()
    }
}

impl ProcessEngine {
    pub fn builder(config: EngineConfig) -> ProcessEngineBuilder {
        ProcessEngineBuilder {
            config,
            store: None,
            job_handlers: JobHandlerRegistry::default(),
            batch_handlers: BatchHandlerRegistry::default(),
            interceptors: None,
            init_logging: false,
        }
    }

    pub fn command_executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn services(&self) -> &EngineServices {
        self.executor.services()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services().config
    }

    /// System-level management service; use `with_principal` to act for a caller.
    pub fn management(&self) -> ManagementService {
        ManagementService::new(self.executor.clone())
    }

    pub fn create_batch(
        &self,
        principal: Option<&Principal>,
        operation: CreateBatch,
    ) -> Result<Batch, EngineError> {
        match principal {
            Some(principal) => self.executor.execute_as(principal, operation),
            None => self.executor.execute(operation),
        }
    }

    /// Starts an acquisition thread plus worker pool for this engine.
    pub fn start_job_executor(&self) -> Result<JobExecutorHandle, EngineError> {
        JobExecutor::new(self.executor.clone()).spawn()
    }

    /// Stops the auto-started job executor, if any.
    pub fn close(&self) {
        let handle = self
            .auto_started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        self.close();
    }
}
