//! Purpose: Sizing, location and store settings for a `PersistenceManager`.
//! Exports: `PersistenceConfig`, `StoreParams`, `Routing`.
//! Role: Deserialized from JSON (all fields optional) or built in code.
//! Invariants: `max_record_size` must stay the same for the lifetime of a queue file.
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::codec::MAX_PERSISTENCE_BUF_SIZE;
use crate::core::error::{Error, ErrorKind};
use crate::core::plan::check_max_record_size;
use crate::core::ring::RingOptions;

pub const DEFAULT_CAPACITY: usize = 1 << 20;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_IDLE_BACKOFF_MS: u64 = 1;

/// How the dispatcher picks a worker for each record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    /// Next free mailbox after the last one used. No cross-worker ordering.
    #[default]
    RoundRobin,
    /// Same key, same worker; records for one key are written in order.
    KeyAffinity,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for StoreParams {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: "backstore".to_string(),
        }
    }
}

impl fmt::Debug for StoreParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceConfig {
    /// Initial ring capacity hint in bytes.
    pub capacity: usize,
    pub max_record_size: usize,
    /// Durable queue file; `None` keeps the queue in memory.
    pub queue_path: Option<PathBuf>,
    pub workers: usize,
    pub routing: Routing,
    /// Bound for one idle wait in the dispatcher, the workers and a parked producer.
    pub idle_backoff_ms: u64,
    pub store: StoreParams,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_record_size: MAX_PERSISTENCE_BUF_SIZE,
            queue_path: None,
            workers: DEFAULT_WORKERS,
            routing: Routing::default(),
            idle_backoff_ms: DEFAULT_IDLE_BACKOFF_MS,
            store: StoreParams::default(),
        }
    }
}

impl PersistenceConfig {
    pub fn from_json_path(path: &Path) -> Result<Self, Error> {
        let bytes = std::fs::read(path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid persistence config: {err}"))
                .with_path(path)
                .with_source(err)
        })?;
        config.validate().map_err(|err| err.with_path(path))?;
        Ok(config)
    }

    pub fn with_queue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("workers must be at least 1"));
        }
        check_max_record_size(self.max_record_size)
            .map_err(|err| err.with_hint("Keep max_record_size unchanged for an existing queue file."))?;
        if self.idle_backoff_ms == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("idle_backoff_ms must be at least 1"));
        }
        Ok(())
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn ring_options(&self) -> RingOptions {
        let options = RingOptions::new(self.capacity, self.max_record_size)
            .with_backoff(self.idle_backoff());
        match &self.queue_path {
            Some(path) => options.with_path(path),
            None => options,
        }
    }
}
