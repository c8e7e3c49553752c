// Manager pipeline tests: enqueue through dispatcher and workers into a recording sink.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use backstore::api::{
    CommandKind, PersistedJob, PersistenceConfig, PersistenceManager, RingOptions, Routing,
    SinkError, StoreParams, StoreSink, open_ring, pack,
};

#[derive(Clone, Default)]
struct Recorder {
    writes: Arc<Mutex<Vec<(String, String)>>>,
    delay: Option<Duration>,
    reject_prefix: Option<&'static str>,
}

impl Recorder {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().expect("lock").clone()
    }
}

impl StoreSink for Recorder {
    type Connection = usize;

    fn connect(&self, params: &StoreParams) -> Result<usize, SinkError> {
        assert_eq!(params.database, "backstore");
        Ok(0)
    }

    fn write_to_store(&self, calls: &mut usize, job: &PersistedJob<'_>) -> Result<(), SinkError> {
        *calls += 1;
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let key = String::from_utf8_lossy(job.key()).into_owned();
        let value = job
            .values()
            .first()
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .unwrap_or_default();
        self.writes.lock().expect("lock").push((key.clone(), value));
        match self.reject_prefix {
            Some(prefix) if key.starts_with(prefix) => Err(SinkError::new(1146, "table missing")),
            _ => Ok(()),
        }
    }
}

fn config(workers: usize, routing: Routing) -> PersistenceConfig {
    PersistenceConfig {
        capacity: 1 << 14,
        max_record_size: 512,
        workers,
        routing,
        ..PersistenceConfig::default()
    }
}

#[test]
fn every_record_is_written_once() {
    let sink = Recorder::default();
    let mut manager =
        PersistenceManager::start(&config(4, Routing::RoundRobin), sink.clone()).expect("start");
    for i in 0..500 {
        let key = format!("k{}", i % 50);
        manager
            .enqueue(CommandKind::Set, &[key, i.to_string()])
            .expect("enqueue");
    }
    assert!(manager.wait_idle(Duration::from_secs(10)));
    let info = manager.info();
    manager.shutdown().expect("shutdown");

    assert_eq!(info.jobs_written, 500);
    assert_eq!(info.jobs_failed, 0);
    assert_eq!(info.outstanding, 0);
    assert_eq!(info.read_count, info.write_count);

    let mut values: Vec<u32> = sink
        .writes()
        .iter()
        .map(|(_, value)| value.parse().expect("number"))
        .collect();
    values.sort_unstable();
    assert_eq!(values, (0..500).collect::<Vec<_>>());
}

#[test]
fn key_affinity_keeps_per_key_order() {
    let sink = Recorder::slow(Duration::from_micros(200));
    let mut manager =
        PersistenceManager::start(&config(4, Routing::KeyAffinity), sink.clone()).expect("start");
    for i in 0..400 {
        let key = format!("user:{}", i % 8);
        manager
            .enqueue(CommandKind::RPush, &[key, i.to_string()])
            .expect("enqueue");
    }
    assert!(manager.wait_idle(Duration::from_secs(20)));
    manager.shutdown().expect("shutdown");

    let mut per_key: HashMap<String, Vec<u32>> = HashMap::new();
    for (key, value) in sink.writes() {
        per_key
            .entry(key)
            .or_default()
            .push(value.parse().expect("number"));
    }
    assert_eq!(per_key.len(), 8);
    for (key, values) in per_key {
        assert_eq!(values.len(), 50, "{key}");
        assert!(values.windows(2).all(|pair| pair[0] < pair[1]), "{key} out of order");
    }
}

#[test]
fn failed_store_writes_are_counted_not_retried() {
    let sink = Recorder {
        reject_prefix: Some("bad:"),
        ..Recorder::default()
    };
    let mut manager =
        PersistenceManager::start(&config(2, Routing::RoundRobin), sink.clone()).expect("start");
    for i in 0..40 {
        let key = if i % 4 == 0 { format!("bad:{i}") } else { format!("good:{i}") };
        manager.enqueue(CommandKind::Incr, &[key]).expect("enqueue");
    }
    assert!(manager.wait_idle(Duration::from_secs(10)));
    let info = manager.info();
    manager.shutdown().expect("shutdown");

    assert_eq!(info.jobs_failed, 10);
    assert_eq!(info.jobs_written, 30);
    assert_eq!(sink.writes().len(), 40, "each record reaches the sink exactly once");
}

#[test]
fn queued_records_are_replayed_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("jobs.ring");
    {
        // Records accepted before a crash, never dispatched.
        let (mut producer, _consumer) =
            open_ring(RingOptions::new(1 << 14, 512).with_path(&path)).expect("open");
        let mut record = Vec::new();
        for i in 0..25 {
            pack(CommandKind::Set, 1_700_000_000, &[format!("pre:{i}"), i.to_string()], 512, &mut record)
                .expect("pack");
            producer.push(&record).expect("push");
        }
    }

    let sink = Recorder::default();
    let config = config(3, Routing::RoundRobin).with_queue_path(&path);
    let manager = PersistenceManager::start(&config, sink.clone()).expect("start");
    assert!(manager.wait_idle(Duration::from_secs(10)));
    assert_eq!(manager.info().jobs_written, 25);
    manager.shutdown().expect("shutdown");

    let mut keys: Vec<String> = sink.writes().into_iter().map(|(key, _)| key).collect();
    keys.sort();
    let mut expected: Vec<String> = (0..25).map(|i| format!("pre:{i}")).collect();
    expected.sort();
    assert_eq!(keys, expected);
}

#[test]
fn shutdown_leaves_undispatched_records_for_next_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("jobs.ring");
    let config = config(1, Routing::RoundRobin).with_queue_path(&path);

    let first = Recorder::slow(Duration::from_millis(2));
    let mut manager = PersistenceManager::start(&config, first.clone()).expect("start");
    for i in 0..200 {
        manager
            .enqueue(CommandKind::Set, &[format!("k{i}"), i.to_string()])
            .expect("enqueue");
    }
    manager.shutdown().expect("shutdown");
    let delivered_first = first.writes().len();
    assert!(delivered_first < 200, "a slow sink cannot drain 200 records instantly");

    let second = Recorder::default();
    let manager = PersistenceManager::start(&config, second.clone()).expect("restart");
    assert!(manager.wait_idle(Duration::from_secs(10)));
    manager.shutdown().expect("shutdown");

    let mut values: Vec<u32> = first
        .writes()
        .into_iter()
        .chain(second.writes())
        .map(|(_, value)| value.parse().expect("number"))
        .collect();
    values.sort_unstable();
    assert_eq!(values, (0..200).collect::<Vec<_>>(), "no record lost or repeated");
}

#[test]
fn idle_pipeline_counts_idle_cycles() {
    let manager =
        PersistenceManager::start(&config(1, Routing::RoundRobin), Recorder::default())
            .expect("start");
    thread::sleep(Duration::from_millis(30));
    let info = manager.info();
    assert!(info.idle_cycles > 0);
    assert_eq!(info.write_count, 0);
    manager.shutdown().expect("shutdown");
}
