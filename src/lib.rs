//! Purpose: Write-behind persistence queue library used by the `backstore` CLI and tests.
//! Exports: `core` (ring, codec, errors), `persistence` (dispatcher, workers, manager), `api`.
//! Role: Accepts mutating commands from one caller and delivers them to a store asynchronously.
//! Invariants: Records leave the ring in FIFO order and only after a worker has taken a copy.
//! Invariants: Corruption is surfaced as `ErrorKind::Corrupt`; only the threads decide to abort.
pub mod api;
pub mod core;
pub mod persistence;
