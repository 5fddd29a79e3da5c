//! # Taskbus Core
//!
//! Shared foundation for the scheduler and the message bus:
//! error type, TOML configuration, log redaction, and the
//! record store collaborator used for historical records.

pub mod config;
pub mod error;
pub mod redact;
pub mod store;

pub use config::TaskbusConfig;
pub use error::{Result, TaskbusError};
pub use store::{FileStore, MemoryStore, RecordStore};
