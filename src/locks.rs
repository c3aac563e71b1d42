//! # Advisory mutual exclusion over named hardware channels.
//!
//! One PWM line, LED channel, or heater output must have at most one writer at
//! a time, even when the writers are different jobs inside the same process
//! (e.g. a calibration routine claims a channel that a temperature controller
//! then checks before acting). [`LockSet`] is the single mutual-exclusion
//! primitive for this: process-wide, advisory, independent of which job holds
//! the claim.
//!
//! Contention is signalled as a `false` return from [`LockSet::acquire`], never
//! an error, so callers can retry, skip, or log as they see fit.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Process-wide set of held hardware-channel locks.
///
/// Constructed once at startup and cloned into every job; all clones share
/// state.
#[derive(Clone, Default)]
pub struct LockSet {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to claim `resource_id`. Non-blocking; `false` if already held.
    pub fn acquire(&self, resource_id: &str) -> bool {
        self.lock_held().insert(resource_id.to_string())
    }

    /// Releases `resource_id`. Idempotent: releasing an unheld lock is a no-op,
    /// so cleanup paths can call this unconditionally.
    pub fn release(&self, resource_id: &str) {
        self.lock_held().remove(resource_id);
    }

    /// Whether `resource_id` is currently claimed by anyone in this process.
    pub fn is_locked(&self, resource_id: &str) -> bool {
        self.lock_held().contains(resource_id)
    }

    /// Claims `resource_id` and returns a guard that releases it on every exit
    /// path, including panics. `None` if already held.
    pub fn scoped(&self, resource_id: &str) -> Option<LockGuard> {
        if self.acquire(resource_id) {
            Some(LockGuard {
                set: self.clone(),
                resource_id: resource_id.to_string(),
            })
        } else {
            None
        }
    }

    fn lock_held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Scoped claim on a hardware channel; released on drop.
pub struct LockGuard {
    set: LockSet,
    resource_id: String,
}

impl LockGuard {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.set.release(&self.resource_id);
    }
}
