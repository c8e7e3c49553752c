//! Purpose: Bounded in-process wakeups for the producer, dispatcher and workers.
//! Exports: `Signal`, `WaitOutcome`.
//! Role: Replaces sleep polling; every wait still ends after its timeout.
//! Invariants: A post before a wait is not lost (the pending flag latches it).
//! Invariants: Callers re-check their own condition after any wakeup.
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

#[derive(Debug, Default)]
pub struct Signal {
    pending: Mutex<bool>,
    ready: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        self.ready.notify_all();
    }

    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if *pending {
            *pending = false;
            return WaitOutcome::Signaled;
        }

        let (mut pending, _) = self
            .ready
            .wait_timeout(pending, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        if *pending {
            *pending = false;
            return WaitOutcome::Signaled;
        }
        WaitOutcome::TimedOut
    }
}
