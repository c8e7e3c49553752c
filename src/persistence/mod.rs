// Dispatcher, worker pool and the manager handle that owns them.
pub mod config;
pub(crate) mod dispatcher;
pub(crate) mod mailbox;
pub mod manager;
pub mod sink;
pub(crate) mod worker;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::core::error::Error;

/// The idle counter restarts at zero when it reaches this value.
pub const IDLE_CYCLES_WRAP: u32 = 2_147_483_640;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    idle_cycles: AtomicU32,
    pub(crate) jobs_dispatched: AtomicU64,
    pub(crate) jobs_written: AtomicU64,
    pub(crate) jobs_failed: AtomicU64,
}

impl Counters {
    pub(crate) fn idle_tick(&self) {
        let _ = self
            .idle_cycles
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cycles| {
                Some(next_idle_cycles(cycles))
            });
    }

    pub(crate) fn idle_cycles(&self) -> u32 {
        self.idle_cycles.load(Ordering::Relaxed)
    }
}

fn next_idle_cycles(cycles: u32) -> u32 {
    let next = cycles + 1;
    if next >= IDLE_CYCLES_WRAP { 0 } else { next }
}

/// Unrecoverable queue state: log and abort the whole process.
pub(crate) fn fatal(role: &str, err: &Error) -> ! {
    tracing::error!(role, error = %err, "persistence queue corrupt, aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::{Counters, IDLE_CYCLES_WRAP, next_idle_cycles};

    #[test]
    fn idle_counter_wraps_before_overflow() {
        assert_eq!(next_idle_cycles(0), 1);
        assert_eq!(next_idle_cycles(IDLE_CYCLES_WRAP - 2), IDLE_CYCLES_WRAP - 1);
        assert_eq!(next_idle_cycles(IDLE_CYCLES_WRAP - 1), 0);
    }

    #[test]
    fn idle_tick_increments() {
        let counters = Counters::default();
        counters.idle_tick();
        counters.idle_tick();
        assert_eq!(counters.idle_cycles(), 2);
    }
}
