use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::context::CommandContext;
use crate::error::JobError;

/// Applies one batch target.
pub trait BatchJobHandler: Send + Sync {
    fn batch_type(&self) -> &str;

    fn execute(
        &self,
        target: &str,
        payload: &JsonValue,
        ctx: &mut CommandContext,
    ) -> Result<(), JobError>;
}

impl<H: BatchJobHandler + ?Sized> BatchJobHandler for Arc<H> {
    fn batch_type(&self) -> &str {
        (**self).batch_type()
    }

    fn execute(
        &self,
        target: &str,
        payload: &JsonValue,
        ctx: &mut CommandContext,
    ) -> Result<(), JobError> {
        (**self).execute(target, payload, ctx)
    }
}

/// Batch handler backed by a closure.
pub struct FnBatchHandler<F> {
    batch_type: String,
    body: F,
}

impl<F> FnBatchHandler<F>
where
    F: Fn(&str, &JsonValue, &mut CommandContext) -> Result<(), JobError> + Send + Sync,
{
    pub fn new(batch_type: impl Into<String>, body: F) -> Self {
        Self {
            batch_type: batch_type.into(),
            body,
        }
    }
}

impl<F> BatchJobHandler for FnBatchHandler<F>
where
    F: Fn(&str, &JsonValue, &mut CommandContext) -> Result<(), JobError> + Send + Sync,
{
    fn batch_type(&self) -> &str {
        &self.batch_type
    }

    fn execute(
        &self,
        target: &str,
        payload: &JsonValue,
        ctx: &mut CommandContext,
    ) -> Result<(), JobError> {
        (self.body)(target, payload, ctx)
    }
}

/// Batch handlers keyed by batch type.
#[derive(Clone, Default)]
pub struct BatchHandlerRegistry {
    handlers: HashMap<String, Arc<dyn BatchJobHandler>>,
}

impl core::fmt::Debug for BatchHandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_list().entries(types).finish()
    }
}

impl BatchHandlerRegistry {
    /// Registers `handler` under its `batch_type()`, replacing any previous one.
    pub fn register<H: BatchJobHandler + 'static>(&mut self, handler: H) {
        self.handlers
            .insert(handler.batch_type().to_string(), Arc::new(handler));
    }

    pub fn get(&self, batch_type: &str) -> Option<Arc<dyn BatchJobHandler>> {
        self.handlers.get(batch_type).cloned()
    }

    pub fn contains(&self, batch_type: &str) -> bool {
        self.handlers.contains_key(batch_type)
    }
}
