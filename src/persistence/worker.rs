// One store connection per thread, fed from its mailbox.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::core::codec::unpack;
use crate::core::error::{Error, ErrorKind};
use crate::persistence::mailbox::Inbox;
use crate::persistence::sink::{SinkError, StoreSink};
use crate::persistence::{Counters, fatal};

pub(crate) struct Worker<S: StoreSink> {
    id: usize,
    inbox: Inbox,
    sink: Arc<S>,
    conn: S::Connection,
    idle_backoff: Duration,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
}

impl<S: StoreSink> Worker<S> {
    pub(crate) fn new(
        id: usize,
        inbox: Inbox,
        sink: Arc<S>,
        conn: S::Connection,
        idle_backoff: Duration,
        counters: Arc<Counters>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            inbox,
            sink,
            conn,
            idle_backoff,
            counters,
            stop,
        }
    }

    /// Serves the mailbox until stop is requested and the slot is empty.
    /// `stop` must only be raised once nothing can be delivered any more.
    pub(crate) fn run(mut self) {
        tracing::debug!(worker = self.id, "worker started");
        loop {
            match self.run_once() {
                Some(Err(err)) => fatal("worker", &err),
                Some(Ok(())) => {}
                None => {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    self.inbox.wait(self.idle_backoff);
                }
            }
        }
        tracing::debug!(worker = self.id, "worker stopped");
    }

    /// Handles the occupied slot, if any. Store failures are counted, not returned;
    /// only a record that cannot be decoded is an error.
    pub(crate) fn run_once(&mut self) -> Option<Result<(), Error>> {
        let Self {
            id,
            inbox,
            sink,
            conn,
            counters,
            ..
        } = self;
        inbox.take(|payload| -> Result<(), Error> {
            let job = unpack(payload)?;
            match sink.write_to_store(conn, &job) {
                Ok(()) => {
                    counters.jobs_written.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        worker = *id,
                        command = %job.command,
                        key = %String::from_utf8_lossy(job.key()),
                        code = err.code,
                        error = %err.message,
                        "store write failed, record dropped"
                    );
                }
            }
            Ok(())
        })
    }
}

/// Wraps a sink connection failure for `PersistenceManager::start`.
pub(crate) fn connect_error(worker: usize, err: SinkError) -> Error {
    Error::new(ErrorKind::Store)
        .with_message(format!("worker {worker} could not connect to the store"))
        .with_hint("Check the store host, port and credentials in the persistence config.")
        .with_source(err)
}
