//! Purpose: Single-slot handoff from the dispatcher to one worker.
//! Exports: `mailbox`, `Outbox`, `Inbox`, `MailboxMonitor`.
//! Role: Lets the dispatcher release a ring record as soon as a worker owns a copy.
//! Invariants: The length is the publication flag: non-zero means the buffer belongs to the worker.
//! Invariants: The dispatcher writes the buffer only while the length is zero.
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::notify::{Signal, WaitOutcome};

struct Slot {
    len: AtomicUsize,
    buf: UnsafeCell<Box<[u8]>>,
    ready: Signal,
    freed: Arc<Signal>,
}

// The buffer is written only by the `Outbox` while `len == 0` and read only by
// the `Inbox` while `len != 0`; the Release/Acquire pair on `len` orders the two.
unsafe impl Sync for Slot {}

/// Creates one slot able to hold records shorter than `max_record_size`.
/// `freed` is posted every time the worker empties the slot.
pub(crate) fn mailbox(
    max_record_size: usize,
    freed: Arc<Signal>,
) -> (Outbox, Inbox, MailboxMonitor) {
    let slot = Arc::new(Slot {
        len: AtomicUsize::new(0),
        buf: UnsafeCell::new(vec![0u8; max_record_size].into_boxed_slice()),
        ready: Signal::new(),
        freed,
    });
    (
        Outbox {
            slot: Arc::clone(&slot),
        },
        Inbox {
            slot: Arc::clone(&slot),
        },
        MailboxMonitor { slot },
    )
}

/// Dispatcher end.
pub(crate) struct Outbox {
    slot: Arc<Slot>,
}

impl Outbox {
    pub(crate) fn is_free(&self) -> bool {
        self.slot.len.load(Ordering::Acquire) == 0
    }

    /// Copies `payload` into the slot and wakes the worker. Returns false if occupied.
    pub(crate) fn deliver(&mut self, payload: &[u8]) -> bool {
        if !self.is_free() || payload.is_empty() {
            return false;
        }
        let buf = unsafe { &mut *self.slot.buf.get() };
        if payload.len() > buf.len() {
            return false;
        }
        buf[..payload.len()].copy_from_slice(payload);
        self.slot.len.store(payload.len(), Ordering::Release);
        self.slot.ready.post();
        true
    }

    /// Wakes the worker without handing it anything.
    pub(crate) fn nudge(&self) {
        self.slot.ready.post();
    }
}

/// Worker end.
pub(crate) struct Inbox {
    slot: Arc<Slot>,
}

impl Inbox {
    /// Runs `handle` on the occupied slot, then frees it and wakes the dispatcher.
    pub(crate) fn take<R>(&mut self, handle: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let len = self.slot.len.load(Ordering::Acquire);
        if len == 0 {
            return None;
        }
        let buf = unsafe { &*self.slot.buf.get() };
        let outcome = handle(&buf[..len]);
        self.slot.len.store(0, Ordering::Release);
        self.slot.freed.post();
        Some(outcome)
    }

    pub(crate) fn wait(&self, timeout: Duration) -> WaitOutcome {
        self.slot.ready.wait(timeout)
    }
}

#[derive(Clone)]
pub(crate) struct MailboxMonitor {
    slot: Arc<Slot>,
}

impl MailboxMonitor {
    pub(crate) fn is_empty(&self) -> bool {
        self.slot.len.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::mailbox;
    use crate::core::notify::{Signal, WaitOutcome};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn deliver_then_take_frees_slot() {
        let freed = Arc::new(Signal::new());
        let (mut outbox, mut inbox, monitor) = mailbox(16, Arc::clone(&freed));
        assert!(inbox.take(|_| ()).is_none());

        assert!(outbox.deliver(b"job-1"));
        assert!(!monitor.is_empty());
        assert!(!outbox.deliver(b"job-2"), "occupied slot refuses a second record");

        let seen = inbox.take(|payload| payload.to_vec()).expect("occupied");
        assert_eq!(seen, b"job-1");
        assert!(monitor.is_empty());
        assert!(outbox.is_free());
        assert_eq!(freed.wait(Duration::from_millis(5)), WaitOutcome::Signaled);
    }

    #[test]
    fn oversize_payload_is_refused() {
        let (mut outbox, _inbox, monitor) = mailbox(4, Arc::new(Signal::new()));
        assert!(!outbox.deliver(b"too long"));
        assert!(!outbox.deliver(b""));
        assert!(monitor.is_empty());
    }

    #[test]
    fn worker_thread_sees_delivered_bytes() {
        let (mut outbox, mut inbox, _monitor) = mailbox(64, Arc::new(Signal::new()));
        let worker = thread::spawn(move || {
            loop {
                if let Some(payload) = inbox.take(|payload| payload.to_vec()) {
                    return payload;
                }
                inbox.wait(Duration::from_millis(5));
            }
        });
        assert!(outbox.deliver(b"hello worker"));
        assert_eq!(worker.join().expect("join"), b"hello worker");
    }
}
