//! Transaction lifecycle hooks.
//!
//! ```text
//! body ok  -> Committing -> flush -> Committed
//! body err -> RollingBack -> discard unit of work -> RolledBack
//! ```
//!
//! A `Committing` listener may veto the commit by returning an error (the
//! context then rolls back). Errors from every other phase are logged and
//! swallowed. Listeners run once and may register further listeners, which
//! run in the same notification round.

use std::collections::HashMap;

use crate::context::CommandContext;
use crate::error::EngineError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransactionPhase {
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionPhase {
    pub fn can_veto(self) -> bool {
        self == TransactionPhase::Committing
    }
}

pub type TransactionListener = Box<dyn FnOnce(&mut CommandContext) -> Result<(), EngineError>>;

#[derive(Default)]
pub struct TransactionHooks {
    listeners: HashMap<TransactionPhase, Vec<TransactionListener>>,
}

impl core::fmt::Debug for TransactionHooks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let counts: HashMap<_, _> = self.listeners.iter().map(|(p, l)| (*p, l.len())).collect();
        f.debug_struct("TransactionHooks").field("listeners", &counts).finish()
    }
}

impl TransactionHooks {
    pub fn add_listener(&mut self, phase: TransactionPhase, listener: TransactionListener) {
        self.listeners.entry(phase).or_default().push(listener);
    }

    /// Remove and return the listeners registered for `phase`, in registration order.
    pub fn take(&mut self, phase: TransactionPhase) -> Vec<TransactionListener> {
        self.listeners.remove(&phase).unwrap_or_default()
    }

    pub fn clear(&mut self, phase: TransactionPhase) {
        self.listeners.remove(&phase);
    }

    pub fn len(&self, phase: TransactionPhase) -> usize {
        self.listeners.get(&phase).map(Vec::len).unwrap_or(0)
    }
}
