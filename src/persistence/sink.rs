// Boundary to the backing store: one connection per worker, one call per record.
use std::error::Error as StdError;
use std::fmt;

use crate::core::codec::PersistedJob;
use crate::persistence::config::StoreParams;

/// Translates decoded commands into store operations.
///
/// `connect` runs once per worker at start-up; `write_to_store` runs on that
/// worker's thread for every record routed to it. A failed write is final for
/// the record; it is logged and counted, never retried.
pub trait StoreSink: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self, params: &StoreParams) -> Result<Self::Connection, SinkError>;

    fn write_to_store(
        &self,
        conn: &mut Self::Connection,
        job: &PersistedJob<'_>,
    ) -> Result<(), SinkError>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SinkError {
    /// Store-specific result code.
    pub code: i32,
    pub message: String,
}

impl SinkError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error {}: {}", self.code, self.message)
    }
}

impl StdError for SinkError {}
