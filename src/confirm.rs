//! Actor-keyed registry of pending confirmations, backing restore's
//! abortable countdown.
//!
//! At most one pending confirmation per actor identity; registering a new
//! one for an actor that already has one aborts the old one first, the
//! same "last registration wins" semantics a plain dict keyed by actor
//! would give.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct ConfirmRegistry {
    pending: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

/// Handle to one registration; the countdown polls [`is_aborted`](Self::is_aborted)
/// between ticks.
pub struct ConfirmToken {
    actor: String,
    aborted: Arc<AtomicBool>,
}

impl ConfirmRegistry {
    pub fn new() -> ConfirmRegistry {
        ConfirmRegistry::default()
    }

    pub fn register(&self, actor: impl Into<String>) -> ConfirmToken {
        let actor = actor.into();
        let aborted = Arc::new(AtomicBool::new(false));
        let mut pending = self.pending.lock().unwrap();
        if let Some(prev) = pending.insert(actor.clone(), aborted.clone()) {
            prev.store(true, Ordering::SeqCst);
        }
        ConfirmToken { actor, aborted }
    }

    /// Abort the pending confirmation for `actor`, consuming it. Returns
    /// whether an entry was actually present.
    pub fn abort(&self, actor: &str) -> bool {
        match self.pending.lock().unwrap().remove(actor) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn clear(&self, token: &ConfirmToken) {
        self.pending.lock().unwrap().remove(&token.actor);
    }
}

impl ConfirmToken {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Consumes the token's registry entry on drop, so an expired or completed
/// countdown doesn't leave a stale entry a later `abort` could still hit.
pub struct Guarded<'a> {
    registry: &'a ConfirmRegistry,
    token: ConfirmToken,
}

impl<'a> Guarded<'a> {
    pub fn new(registry: &'a ConfirmRegistry, token: ConfirmToken) -> Guarded<'a> {
        Guarded { registry, token }
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_aborted()
    }
}

impl Drop for Guarded<'_> {
    fn drop(&mut self) {
        self.registry.clear(&self.token);
    }
}
