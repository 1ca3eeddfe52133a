//! Operation pipeline.
//!
//! Every engine operation, whether triggered by a caller or by the job
//! executor, runs through the same ordered chain of interceptors:
//!
//! ```text
//! LogInterceptor
//!   -> ContextInterceptor        (create or reuse the CommandContext)
//!   -> AuthorizationInterceptor  (check the principal's permissions)
//!   -> TransactionInterceptor    (flush + commit, or roll back)
//!   -> operation body
//! ```
//!
//! Each interceptor may run code before and after delegating to `Next`, or
//! short-circuit with an error. Operations are type-erased while they travel
//! through the chain; the typed output is recovered by `CommandExecutor`.

pub mod executor;
pub mod standard;

use std::sync::Arc;

use jobflow_auth::Permission;

use crate::context::CommandContext;
use crate::error::EngineError;

pub use executor::CommandExecutor;
pub use standard::{AuthorizationInterceptor, ContextInterceptor, LogInterceptor, TransactionInterceptor};

/// A unit of engine work executed inside a `CommandContext`.
pub trait Operation {
    type Output;

    fn name(&self) -> &str;

    /// Permissions the calling principal must hold. System invocations
    /// (no principal) are not checked.
    fn required_permissions(&self) -> Vec<Permission> {
        Vec::new()
    }

    fn execute(&mut self, ctx: &mut CommandContext) -> Result<Self::Output, EngineError>;
}

/// Operation built from a closure.
pub struct FnOperation<F> {
    name: &'static str,
    permissions: Vec<Permission>,
    body: Option<F>,
}

impl<F, T> FnOperation<F>
where
    F: FnOnce(&mut CommandContext) -> Result<T, EngineError>,
{
    pub fn new(name: &'static str, body: F) -> Self {
        Self {
            name,
            permissions: Vec::new(),
            body: Some(body),
        }
    }

    pub fn requiring(mut self, permissions: Vec<Permission>) -> Self {
        self.permissions = permissions;
        self
    }
}

impl<F, T> Operation for FnOperation<F>
where
    F: FnOnce(&mut CommandContext) -> Result<T, EngineError>,
{
    type Output = T;

    fn name(&self) -> &str {
        self.name
    }

    fn required_permissions(&self) -> Vec<Permission> {
        self.permissions.clone()
    }

    fn execute(&mut self, ctx: &mut CommandContext) -> Result<T, EngineError> {
        let body = self
            .body
            .take()
            .ok_or_else(|| EngineError::Internal(format!("operation '{}' executed twice", self.name)))?;
        body(ctx)
    }
}

/// Object-safe view of an operation plus its output slot.
pub(crate) trait ErasedOperation {
    fn name(&self) -> &str;
    fn required_permissions(&self) -> Vec<Permission>;
    fn run(&mut self, ctx: &mut CommandContext) -> Result<(), EngineError>;
}

pub(crate) struct TypedOperation<O: Operation> {
    pub(crate) operation: O,
    pub(crate) output: Option<O::Output>,
}

impl<O: Operation> ErasedOperation for TypedOperation<O> {
    fn name(&self) -> &str {
        self.operation.name()
    }

    fn required_permissions(&self) -> Vec<Permission> {
        self.operation.required_permissions()
    }

    fn run(&mut self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        self.output = Some(self.operation.execute(ctx)?);
        Ok(())
    }
}

pub(crate) enum ContextSlot<'a> {
    Empty,
    Owned(Box<CommandContext>),
    Borrowed(&'a mut CommandContext),
}

/// One operation travelling through the interceptor chain.
pub struct Invocation<'a> {
    operation: &'a mut dyn ErasedOperation,
    context: ContextSlot<'a>,
    principal: Option<jobflow_auth::Principal>,
    executor: CommandExecutor,
    owns_context: bool,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(
        operation: &'a mut dyn ErasedOperation,
        context: ContextSlot<'a>,
        principal: Option<jobflow_auth::Principal>,
        executor: CommandExecutor,
    ) -> Self {
        Self {
            operation,
            context,
            principal,
            executor,
            owns_context: false,
        }
    }

    pub fn operation_name(&self) -> &str {
        self.operation.name()
    }

    pub fn required_permissions(&self) -> Vec<Permission> {
        self.operation.required_permissions()
    }

    pub fn has_context(&self) -> bool {
        !matches!(self.context, ContextSlot::Empty)
    }

    /// `true` when this invocation created its context (and therefore commits it).
    pub fn owns_context(&self) -> bool {
        self.owns_context
    }

    pub fn context(&mut self) -> Option<&mut CommandContext> {
        match &mut self.context {
            ContextSlot::Empty => None,
            ContextSlot::Owned(ctx) => Some(ctx.as_mut()),
            ContextSlot::Borrowed(ctx) => Some(&mut **ctx),
        }
    }

    pub(crate) fn open_context(&mut self) {
        if self.has_context() {
            return;
        }
        let ctx = CommandContext::new(self.executor.clone(), self.principal.take());
        self.context = ContextSlot::Owned(Box::new(ctx));
        self.owns_context = true;
    }

    pub(crate) fn close_context(&mut self) {
        if self.owns_context {
            self.context = ContextSlot::Empty;
            self.owns_context = false;
        }
    }

    fn run_body(&mut self) -> Result<(), EngineError> {
        let Invocation {
            operation, context, ..
        } = self;
        match context {
            ContextSlot::Owned(ctx) => operation.run(ctx),
            ContextSlot::Borrowed(ctx) => operation.run(ctx),
            ContextSlot::Empty => Err(EngineError::Internal(format!(
                "operation '{}' reached its body without a command context",
                operation.name()
            ))),
        }
    }
}

/// Pipeline stage wrapping every operation.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn intercept(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<(), EngineError>;
}

/// The rest of the chain after the current interceptor.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(rest: &'a [Arc<dyn Interceptor>]) -> Self {
        Self { rest }
    }

    pub fn proceed(self, invocation: &mut Invocation<'_>) -> Result<(), EngineError> {
        match self.rest.split_first() {
            Some((head, tail)) => head.intercept(invocation, Next::new(tail)),
            None => invocation.run_body(),
        }
    }
}
