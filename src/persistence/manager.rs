//! Purpose: The handle a server holds to persist commands write-behind.
//! Exports: `PersistenceManager`, `PersistenceInfo`.
//! Role: Owns the ring producer, the dispatcher thread and the worker pool.
//! Invariants: One caller enqueues (`&mut self`); everything after `push` is asynchronous.
//! Invariants: Records not yet handed to a worker survive shutdown in the queue file.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::codec::{pack, unix_timestamp};
use crate::core::command::CommandKind;
use crate::core::error::{Error, ErrorKind};
use crate::core::notify::Signal;
use crate::core::ring::{self, Producer, RingMonitor};
use crate::persistence::Counters;
use crate::persistence::config::PersistenceConfig;
use crate::persistence::dispatcher::Dispatcher;
use crate::persistence::mailbox::{MailboxMonitor, mailbox};
use crate::persistence::sink::StoreSink;
use crate::persistence::worker::{Worker, connect_error};

const IDLE_POLL: Duration = Duration::from_millis(1);

/// Point-in-time view of the queue and the pipeline behind it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PersistenceInfo {
    /// Bytes written to the ring and not yet released by the dispatcher.
    pub outstanding: u64,
    pub idle_cycles: u32,
    pub write_count: u64,
    pub read_count: u64,
    pub capacity: usize,
    pub jobs_dispatched: u64,
    pub jobs_written: u64,
    pub jobs_failed: u64,
}

pub struct PersistenceManager {
    producer: Producer,
    monitor: RingMonitor,
    mailboxes: Vec<MailboxMonitor>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    /// Raised only after the dispatcher thread has been joined.
    workers_stop: Arc<AtomicBool>,
    dispatcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    max_record_size: usize,
    scratch: Vec<u8>,
}

impl PersistenceManager {
    /// Opens the queue, connects every worker, then starts the threads.
    pub fn start<S: StoreSink>(config: &PersistenceConfig, sink: S) -> Result<Self, Error> {
        config.validate()?;
        let (producer, consumer) = ring::open(config.ring_options())?;
        let monitor = producer.monitor();

        let sink = Arc::new(sink);
        let mut connections = Vec::with_capacity(config.workers);
        for worker in 0..config.workers {
            let conn = sink
                .connect(&config.store)
                .map_err(|err| connect_error(worker, err))?;
            connections.push(conn);
        }

        let counters = Arc::new(Counters::default());
        let stop = Arc::new(AtomicBool::new(false));
        let workers_stop = Arc::new(AtomicBool::new(false));
        let freed = Arc::new(Signal::new());
        let idle_backoff = config.idle_backoff();

        let mut outboxes = Vec::with_capacity(config.workers);
        let mut mailboxes = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        let mut spawned = Ok(());
        for (id, conn) in connections.into_iter().enumerate() {
            let (outbox, inbox, mailbox_monitor) = mailbox(config.max_record_size, Arc::clone(&freed));
            outboxes.push(outbox);
            mailboxes.push(mailbox_monitor);
            let worker = Worker::new(
                id,
                inbox,
                Arc::clone(&sink),
                conn,
                idle_backoff,
                Arc::clone(&counters),
                Arc::clone(&workers_stop),
            );
            match spawn(format!("backstore-worker-{id}"), move || worker.run()) {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    spawned = Err(err);
                    break;
                }
            }
        }

        let dispatcher = Dispatcher::new(
            consumer,
            outboxes,
            freed,
            config.routing,
            idle_backoff,
            Arc::clone(&counters),
            Arc::clone(&stop),
        );
        let dispatcher = match spawned {
            Ok(()) => spawn("backstore-dispatcher".to_string(), move || dispatcher.run()),
            Err(err) => Err(err),
        };

        let mut manager = Self {
            producer,
            monitor,
            mailboxes,
            counters,
            stop,
            workers_stop,
            dispatcher: None,
            workers,
            max_record_size: config.max_record_size,
            scratch: Vec::with_capacity(config.max_record_size),
        };
        match dispatcher {
            Ok(handle) => manager.dispatcher = Some(handle),
            Err(err) => {
                let _ = manager.stop_threads();
                return Err(err);
            }
        }

        let snapshot = manager.monitor.snapshot();
        tracing::info!(
            path = ?config.queue_path,
            workers = config.workers,
            routing = ?config.routing,
            write_count = snapshot.write_count,
            read_count = snapshot.read_count,
            outstanding = snapshot.outstanding(),
            capacity = snapshot.capacity,
            "persistence started"
        );
        Ok(manager)
    }

    /// Stamps, packs and queues one command. Capacity errors are returned
    /// before anything reaches the ring.
    pub fn enqueue<A: AsRef<[u8]>>(&mut self, command: CommandKind, args: &[A]) -> Result<(), Error> {
        self.enqueue_at(command, unix_timestamp(), args)
    }

    pub fn enqueue_at<A: AsRef<[u8]>>(
        &mut self,
        command: CommandKind,
        timestamp: u32,
        args: &[A],
    ) -> Result<(), Error> {
        if let Err(err) = pack(command, timestamp, args, self.max_record_size, &mut self.scratch) {
            if err.kind().is_capacity() {
                tracing::debug!(command = %command, error = %err, "command not persisted");
            }
            return Err(err);
        }
        self.producer.push(&self.scratch)
    }

    pub fn info(&self) -> PersistenceInfo {
        let snapshot = self.monitor.snapshot();
        PersistenceInfo {
            outstanding: snapshot.outstanding(),
            idle_cycles: self.counters.idle_cycles(),
            write_count: snapshot.write_count,
            read_count: snapshot.read_count,
            capacity: snapshot.capacity,
            jobs_dispatched: self.counters.jobs_dispatched.load(Ordering::Relaxed),
            jobs_written: self.counters.jobs_written.load(Ordering::Relaxed),
            jobs_failed: self.counters.jobs_failed.load(Ordering::Relaxed),
        }
    }

    /// Waits until the ring is drained and every mailbox is empty.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // Ring first: a record leaves the ring only once a mailbox holds it.
            if self.monitor.snapshot().outstanding() == 0
                && self.mailboxes.iter().all(MailboxMonitor::is_empty)
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL);
        }
    }

    /// Stops and joins every thread. Records still in the ring stay there.
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.stop_threads()?;
        let info = self.info();
        tracing::info!(
            outstanding = info.outstanding,
            jobs_written = info.jobs_written,
            jobs_failed = info.jobs_failed,
            "persistence stopped"
        );
        Ok(())
    }

    fn stop_threads(&mut self) -> Result<(), Error> {
        self.stop.store(true, Ordering::Release);
        let mut panicked = Vec::new();
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                panicked.push("backstore-dispatcher".to_string());
            }
        }
        self.workers_stop.store(true, Ordering::Release);
        for (id, handle) in self.workers.drain(..).enumerate() {
            if handle.join().is_err() {
                panicked.push(format!("backstore-worker-{id}"));
            }
        }
        if panicked.is_empty() {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Internal)
                .with_message(format!("persistence threads panicked: {}", panicked.join(", "))))
        }
    }
}

impl Drop for PersistenceManager {
    fn drop(&mut self) {
        if let Err(err) = self.stop_threads() {
            tracing::error!(error = %err, "persistence shutdown failed");
        }
    }
}

fn spawn(name: String, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>, Error> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("failed to spawn {name}"))
                .with_source(err)
        })
}

#[cfg(test)]
mod tests {
    use super::PersistenceManager;
    use crate::core::codec::PersistedJob;
    use crate::core::command::CommandKind;
    use crate::core::error::ErrorKind;
    use crate::persistence::config::{PersistenceConfig, StoreParams};
    use crate::persistence::sink::{SinkError, StoreSink};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<(CommandKind, Vec<Vec<u8>>)>>>,
    }

    impl StoreSink for Recorder {
        type Connection = ();

        fn connect(&self, _params: &StoreParams) -> Result<(), SinkError> {
            Ok(())
        }

        fn write_to_store(&self, _conn: &mut (), job: &PersistedJob<'_>) -> Result<(), SinkError> {
            let args = job.args.iter().map(|arg| arg.to_vec()).collect();
            self.seen.lock().expect("lock").push((job.command, args));
            Ok(())
        }
    }

    struct Unreachable;

    impl StoreSink for Unreachable {
        type Connection = ();

        fn connect(&self, params: &StoreParams) -> Result<(), SinkError> {
            Err(SinkError::new(2003, format!("can't connect to {}", params.host)))
        }

        fn write_to_store(&self, _conn: &mut (), _job: &PersistedJob<'_>) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn config() -> PersistenceConfig {
        PersistenceConfig {
            capacity: 4096,
            max_record_size: 256,
            workers: 2,
            ..PersistenceConfig::default()
        }
    }

    #[test]
    fn enqueued_commands_reach_the_sink() {
        let sink = Recorder::default();
        let mut manager = PersistenceManager::start(&config(), sink.clone()).expect("start");
        manager.enqueue(CommandKind::Set, &["greeting", "hello"]).expect("set");
        manager.enqueue(CommandKind::Incr, &["visits"]).expect("incr");
        assert!(manager.wait_idle(Duration::from_secs(5)));

        let info = manager.info();
        assert_eq!(info.outstanding, 0);
        assert_eq!(info.jobs_dispatched, 2);
        assert_eq!(info.jobs_written, 2);
        manager.shutdown().expect("shutdown");

        let mut seen = sink.seen.lock().expect("lock").clone();
        seen.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            seen,
            vec![
                (CommandKind::Set, vec![b"greeting".to_vec(), b"hello".to_vec()]),
                (CommandKind::Incr, vec![b"visits".to_vec()]),
            ]
        );
    }

    #[test]
    fn capacity_errors_are_returned_to_the_caller() {
        let mut manager = PersistenceManager::start(&config(), Recorder::default()).expect("start");
        let key = "k".repeat(40);
        let err = manager.enqueue(CommandKind::Incr, &[key.as_str()]).expect_err("key");
        assert_eq!(err.kind(), ErrorKind::KeySizeExceeded);
        assert!(err.kind().is_capacity());
        let err = manager.enqueue(CommandKind::Set, &["only-key"]).expect_err("arity");
        assert_eq!(err.kind(), ErrorKind::UnsupportedCommand);
        assert_eq!(manager.info().write_count, 0);
    }

    #[test]
    fn connection_failure_aborts_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.ring");
        let config = config().with_queue_path(&path);
        match PersistenceManager::start(&config, Unreachable) {
            Ok(_) => panic!("expected store error"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Store),
        }
        // The queue file lock is released again.
        let manager = PersistenceManager::start(&config, Recorder::default()).expect("restart");
        manager.shutdown().expect("shutdown");
    }
}
