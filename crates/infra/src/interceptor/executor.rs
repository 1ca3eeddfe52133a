use std::sync::Arc;

use jobflow_auth::Principal;

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::services::EngineServices;

use super::standard::{AuthorizationInterceptor, ContextInterceptor, LogInterceptor, TransactionInterceptor};
use super::{ContextSlot, FnOperation, Interceptor, Invocation, Next, Operation, TypedOperation};

struct ExecutorInner {
    interceptors: Vec<Arc<dyn Interceptor>>,
    services: Arc<EngineServices>,
}

/// Entry point for running operations through the interceptor chain.
///
/// Cheap to clone; every clone shares the chain and the engine services.
#[derive(Clone)]
pub struct CommandExecutor {
    inner: Arc<ExecutorInner>,
}

impl core::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<_> = self.inner.interceptors.iter().map(|i| i.name()).collect();
        f.debug_struct("CommandExecutor")
            .field("interceptors", &names)
            .finish()
    }
}

impl CommandExecutor {
    pub fn new(services: Arc<EngineServices>, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                interceptors,
                services,
            }),
        }
    }

    /// Log -> context -> authorization -> transaction -> body.
    pub fn standard(services: Arc<EngineServices>) -> Self {
        Self::new(
            services,
            vec![
                Arc::new(LogInterceptor),
                Arc::new(ContextInterceptor),
                Arc::new(AuthorizationInterceptor),
                Arc::new(TransactionInterceptor),
            ],
        )
    }

    pub fn services(&self) -> &EngineServices {
        &self.inner.services
    }

    pub fn services_arc(&self) -> Arc<EngineServices> {
        self.inner.services.clone()
    }

    /// Run as a system invocation in a fresh context.
    pub fn execute<O: Operation>(&self, operation: O) -> Result<O::Output, EngineError> {
        self.run(operation, ContextSlot::Empty, None)
    }

    /// Run on behalf of `principal` in a fresh context.
    pub fn execute_as<O: Operation>(
        &self,
        principal: &Principal,
        operation: O,
    ) -> Result<O::Output, EngineError> {
        self.run(operation, ContextSlot::Empty, Some(principal.clone()))
    }

    /// Run in a fresh context that commits independently of any caller.
    pub fn execute_requires_new<O: Operation>(
        &self,
        operation: O,
        principal: Option<Principal>,
    ) -> Result<O::Output, EngineError> {
        self.run(operation, ContextSlot::Empty, principal)
    }

    /// System invocation of a closure.
    pub fn execute_fn<T, F>(&self, name: &'static str, body: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut CommandContext) -> Result<T, EngineError>,
    {
        self.execute(FnOperation::new(name, body))
    }

    pub(crate) fn execute_in<O: Operation>(
        &self,
        ctx: &mut CommandContext,
        operation: O,
    ) -> Result<O::Output, EngineError> {
        self.run(operation, ContextSlot::Borrowed(ctx), None)
    }

    fn run<O: Operation>(
        &self,
        operation: O,
        context: ContextSlot<'_>,
        principal: Option<Principal>,
    ) -> Result<O::Output, EngineError> {
        let mut typed = TypedOperation {
            operation,
            output: None,
        };
        {
            let mut invocation = Invocation::new(&mut typed, context, principal, self.clone());
            Next::new(&self.inner.interceptors).proceed(&mut invocation)?;
        }
        typed.output.ok_or_else(|| {
            EngineError::Internal(format!("operation '{}' produced no output", typed.operation.name()))
        })
    }
}
