//! Command context: the per-invocation unit of work, hooks and principal.
//!
//! A context is created by the `ContextInterceptor` (or reused from the
//! caller), lives on one thread, and is dropped when the owning invocation
//! returns. Nested operations either share it (`execute`) or get a fresh one
//! (`requires_new`).

pub mod transaction;

use tracing::warn;

use jobflow_auth::{AuthzError, Principal, can_access_tenant};
use jobflow_core::{Entity, TenantId};
use jobflow_jobs::Job;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::interceptor::{CommandExecutor, Operation};
use crate::services::EngineServices;
use crate::unit_of_work::{FlushSummary, UnitOfWork};

pub use transaction::{TransactionHooks, TransactionListener, TransactionPhase};

pub struct CommandContext {
    executor: CommandExecutor,
    unit_of_work: UnitOfWork,
    hooks: TransactionHooks,
    principal: Option<Principal>,
    rollback_cause: Option<EngineError>,
}

impl core::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandContext")
            .field("unit_of_work", &self.unit_of_work)
            .field("hooks", &self.hooks)
            .field("principal", &self.principal.as_ref().map(|p| p.principal_id))
            .finish()
    }
}

impl CommandContext {
    pub fn new(executor: CommandExecutor, principal: Option<Principal>) -> Self {
        let unit_of_work = UnitOfWork::new(executor.services().store.clone());
        Self {
            executor,
            unit_of_work,
            hooks: TransactionHooks::default(),
            principal,
            rollback_cause: None,
        }
    }

    pub fn unit_of_work(&mut self) -> &mut UnitOfWork {
        &mut self.unit_of_work
    }

    /// `None` for system invocations (job execution, internal maintenance).
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn services(&self) -> &EngineServices {
        self.executor.services()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services().config
    }

    /// Error that triggered the rollback, visible to rollback listeners.
    pub fn rollback_cause(&self) -> Option<&EngineError> {
        self.rollback_cause.as_ref()
    }

    /// Rejects access to rows of another tenant for tenant-scoped principals.
    pub fn check_tenant(&self, tenant_id: Option<TenantId>) -> Result<(), EngineError> {
        match &self.principal {
            Some(principal) if !can_access_tenant(principal, tenant_id) => {
                Err(AuthzError::TenantForbidden.into())
            }
            _ => Ok(()),
        }
    }

    pub fn add_listener<F>(&mut self, phase: TransactionPhase, listener: F)
    where
        F: FnOnce(&mut CommandContext) -> Result<(), EngineError> + 'static,
    {
        self.hooks.add_listener(phase, Box::new(listener));
    }

    /// Run and consume the listeners of `phase`.
    pub fn notify(&mut self, phase: TransactionPhase) -> Result<(), EngineError> {
        loop {
            let listeners = self.hooks.take(phase);
            if listeners.is_empty() {
                return Ok(());
            }
            for listener in listeners {
                if let Err(error) = listener(self) {
                    if phase.can_veto() {
                        return Err(error);
                    }
                    warn!(phase = ?phase, error = %error, "transaction listener failed");
                }
            }
        }
    }

    /// Run `operation` in this context (same unit of work and hooks).
    pub fn execute<O: Operation>(&mut self, operation: O) -> Result<O::Output, EngineError> {
        let executor = self.executor.clone();
        executor.execute_in(self, operation)
    }

    /// Run `operation` in a fresh, independently committed context.
    ///
    /// Its commit is not undone if this context later rolls back.
    pub fn requires_new<O: Operation>(&mut self, operation: O) -> Result<O::Output, EngineError> {
        self.executor
            .execute_requires_new(operation, self.principal.clone())
    }

    pub(crate) fn commit(&mut self) -> Result<FlushSummary, EngineError> {
        self.notify(TransactionPhase::Committing)?;
        let summary = self.unit_of_work.flush()?;

        if summary.inserted_any(Job::ENTITY_TYPE) {
            let signal = self.services().job_signal.clone();
            self.add_listener(TransactionPhase::Committed, move |_| {
                signal.jobs_added();
                Ok(())
            });
        }
        self.hooks.clear(TransactionPhase::RollingBack);
        self.hooks.clear(TransactionPhase::RolledBack);
        self.notify(TransactionPhase::Committed)?;
        Ok(summary)
    }

    pub(crate) fn rollback(&mut self, cause: EngineError) {
        self.rollback_cause = Some(cause);
        self.hooks.clear(TransactionPhase::Committing);
        self.hooks.clear(TransactionPhase::Committed);
        let _ = self.notify(TransactionPhase::RollingBack);
        self.unit_of_work.discard();
        let _ = self.notify(TransactionPhase::RolledBack);
    }
}
