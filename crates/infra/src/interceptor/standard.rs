//! The standard interceptors.

use std::time::Instant;

use tracing::{debug, debug_span, warn};

use jobflow_auth::authorize_all;

use crate::error::EngineError;

use super::{Interceptor, Invocation, Next};

/// Span and timing per operation.
#[derive(Debug, Default)]
pub struct LogInterceptor;

impl Interceptor for LogInterceptor {
    fn name(&self) -> &'static str {
        "log"
    }

    fn intercept(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<(), EngineError> {
        let span = debug_span!("operation", operation = %invocation.operation_name());
        let _entered = span.enter();
        let started = Instant::now();

        let result = next.proceed(invocation);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => debug!(elapsed_ms, "operation completed"),
            Err(error) => debug!(elapsed_ms, error = %error, "operation failed"),
        }
        result
    }
}

/// Creates a context when the caller did not supply one, and drops it afterwards.
#[derive(Debug, Default)]
pub struct ContextInterceptor;

impl Interceptor for ContextInterceptor {
    fn name(&self) -> &'static str {
        "context"
    }

    fn intercept(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<(), EngineError> {
        if invocation.has_context() {
            return next.proceed(invocation);
        }

        invocation.open_context();
        let result = next.proceed(invocation);
        invocation.close_context();
        result
    }
}

/// Checks the operation's required permissions against the context's principal.
#[derive(Debug, Default)]
pub struct AuthorizationInterceptor;

impl Interceptor for AuthorizationInterceptor {
    fn name(&self) -> &'static str {
        "authorization"
    }

    fn intercept(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<(), EngineError> {
        let required = invocation.required_permissions();
        if !required.is_empty() {
            let verdict = match invocation.context().and_then(|ctx| ctx.principal()) {
                Some(principal) => authorize_all(principal, &required).map_err(|e| {
                    warn!(principal_id = %principal.principal_id, error = %e, "authorization denied");
                    e
                }),
                None => Ok(()),
            };
            verdict?;
        }
        next.proceed(invocation)
    }
}

/// Commits (or rolls back) the context when this invocation owns it.
#[derive(Debug, Default)]
pub struct TransactionInterceptor;

impl Interceptor for TransactionInterceptor {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn intercept(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<(), EngineError> {
        if !invocation.owns_context() {
            return next.proceed(invocation);
        }

        let result = next.proceed(invocation);
        let Some(ctx) = invocation.context() else {
            return result;
        };

        match result {
            Ok(()) => match ctx.commit() {
                Ok(summary) => {
                    debug!(
                        inserted = summary.inserted.len(),
                        updated = summary.updated.len(),
                        deleted = summary.deleted.len(),
                        ignored = summary.ignored.len(),
                        "committed"
                    );
                    Ok(())
                }
                Err(error) => {
                    ctx.rollback(error.clone());
                    Err(error)
                }
            },
            Err(error) => {
                ctx.rollback(error.clone());
                Err(error)
            }
        }
    }
}
