//! Purpose: Define the stable public Rust API boundary for backstore.
//! Exports: Core types and operations needed by embedding servers and the CLI.
//! Role: Public, additive-only surface over the ring, codec and persistence pipeline.
//! Invariants: Embedders need nothing outside this module to enqueue and deliver commands.
//! Invariants: Ring internals (plan, backlog geometry) stay crate-private.

mod inspect;

pub use crate::core::codec::{
    MAX_CMD_ARGV, MAX_KEY_LEN, MAX_PERSISTENCE_BUF_SIZE, PersistedJob, pack, unix_timestamp,
    unpack,
};
pub use crate::core::command::{Arity, CommandKind};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::header::{HEADER_SIZE, RingHeader};
pub use crate::core::ring::{
    Consumer, Job, Producer, RingMonitor, RingOptions, RingSnapshot, open as open_ring,
};
pub use crate::persistence::config::{PersistenceConfig, Routing, StoreParams};
pub use crate::persistence::manager::{PersistenceInfo, PersistenceManager};
pub use crate::persistence::sink::{SinkError, StoreSink};
pub use inspect::{QueueIssue, QueueRecord, QueueReport, QueueStatus, inspect_queue};
