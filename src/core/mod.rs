// Core modules implementing the durable ring, record encoding, and error modeling.
pub mod backlog;
pub mod codec;
pub mod command;
pub mod error;
pub mod header;
pub mod notify;
pub mod plan;
pub mod ring;
