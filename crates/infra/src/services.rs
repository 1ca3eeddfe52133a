//! Engine-wide collaborators shared by every command context.

use std::sync::Arc;

use crate::batch::BatchHandlerRegistry;
use crate::config::EngineConfig;
use crate::jobs::{JobHandlerRegistry, JobSignal};
use crate::store::EntityStore;

pub struct EngineServices {
    pub store: Arc<dyn EntityStore>,
    pub config: EngineConfig,
    pub job_handlers: JobHandlerRegistry,
    pub batch_handlers: BatchHandlerRegistry,
    /// Wakes a running job executor when new jobs are committed.
    pub job_signal: JobSignal,
}

impl EngineServices {
    pub fn new(store: Arc<dyn EntityStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            job_handlers: JobHandlerRegistry::default(),
            batch_handlers: BatchHandlerRegistry::default(),
            job_signal: JobSignal::default(),
        }
    }

    pub fn with_job_handlers(mut self, handlers: JobHandlerRegistry) -> Self {
        self.job_handlers = handlers;
        self
    }

    pub fn with_batch_handlers(mut self, handlers: BatchHandlerRegistry) -> Self {
        self.batch_handlers = handlers;
        self
    }
}

impl core::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EngineServices")
            .field("engine", &self.config.engine_name)
            .field("job_handlers", &self.job_handlers)
            .field("batch_handlers", &self.batch_handlers)
            .finish()
    }
}
