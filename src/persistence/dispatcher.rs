//! Purpose: Drain the ring and hand each record to one worker mailbox.
//! Exports: `Dispatcher`, `Cycle`.
//! Role: The ring's only consumer; also carries out ring resizes (inside `pop`).
//! Invariants: A record is released from the ring only after a mailbox holds a copy.
//! Invariants: Corruption aborts the process; other errors back off and retry.
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::core::codec::peek_key;
use crate::core::error::{Error, ErrorKind};
use crate::core::notify::Signal;
use crate::core::ring::Consumer;
use crate::persistence::config::Routing;
use crate::persistence::mailbox::Outbox;
use crate::persistence::{Counters, fatal};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Cycle {
    /// The ring was empty.
    Idle,
    /// One record went to the worker with this index.
    Delivered(usize),
    /// Stop was requested while a record waited for a mailbox; it stays in the ring.
    Stopped,
}

pub(crate) struct Dispatcher {
    consumer: Consumer,
    outboxes: Vec<Outbox>,
    freed: Arc<Signal>,
    routing: Routing,
    next: usize,
    idle_backoff: Duration,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    pub(crate) fn new(
        consumer: Consumer,
        outboxes: Vec<Outbox>,
        freed: Arc<Signal>,
        routing: Routing,
        idle_backoff: Duration,
        counters: Arc<Counters>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            consumer,
            outboxes,
            freed,
            routing,
            next: 0,
            idle_backoff,
            counters,
            stop,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!(workers = self.outboxes.len(), routing = ?self.routing, "dispatcher started");
        while !self.stop.load(Ordering::Acquire) {
            match self.run_once() {
                Ok(Cycle::Stopped) => break,
                Ok(Cycle::Idle) => {
                    self.consumer.wait_for_data(self.idle_backoff);
                }
                Ok(Cycle::Delivered(_)) => {}
                Err(err) if err.kind() == ErrorKind::Corrupt => fatal("dispatcher", &err),
                Err(err) => {
                    tracing::warn!(error = %err, "dispatch failed, backing off");
                    self.consumer.wait_for_data(self.idle_backoff);
                }
            }
        }

        if let Err(err) = self.consumer.sync() {
            tracing::warn!(error = %err, "failed to flush queue file on shutdown");
        }
        for outbox in &self.outboxes {
            outbox.nudge();
        }
        let snapshot = self.consumer.monitor().snapshot();
        tracing::debug!(
            write_count = snapshot.write_count,
            read_count = snapshot.read_count,
            "dispatcher stopped"
        );
    }

    /// One dispatch attempt. An empty ring counts as idle; the caller does the waiting.
    pub(crate) fn run_once(&mut self) -> Result<Cycle, Error> {
        let job = match self.consumer.pop()? {
            Some(job) => job,
            None => {
                self.counters.idle_tick();
                return Ok(Cycle::Idle);
            }
        };

        let affinity = match self.routing {
            Routing::RoundRobin => None,
            Routing::KeyAffinity => Some(worker_for_key(peek_key(&job)?, self.outboxes.len())),
        };

        let target = loop {
            let picked = match affinity {
                Some(index) => self.outboxes[index].is_free().then_some(index),
                None => next_free(&self.outboxes, &mut self.next),
            };
            if let Some(index) = picked {
                break index;
            }
            if self.stop.load(Ordering::Acquire) {
                job.unread();
                return Ok(Cycle::Stopped);
            }
            self.freed.wait(self.idle_backoff);
            self.counters.idle_tick();
        };

        if !self.outboxes[target].deliver(&job) {
            let len = job.len();
            job.unread();
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("mailbox {target} refused a {len} byte record")));
        }
        self.counters.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        drop(job);
        tracing::trace!(worker = target, "record dispatched");
        Ok(Cycle::Delivered(target))
    }
}

/// Scans one lap starting at the mailbox after the last one used.
fn next_free(outboxes: &[Outbox], next: &mut usize) -> Option<usize> {
    let count = outboxes.len();
    let index = (0..count)
        .map(|step| (*next + step) % count)
        .find(|&index| outboxes[index].is_free())?;
    *next = (index + 1) % count;
    Some(index)
}

pub(crate) fn worker_for_key(key: &[u8], workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}
