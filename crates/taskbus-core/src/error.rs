//! Error types shared by every Taskbus crate.

/// Top-level error type for the scheduler and message bus.
#[derive(Debug, thiserror::Error)]
pub enum TaskbusError {
    /// A task or job with this id already exists.
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// No task, job, or subscription with this id.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested feature is switched off in configuration.
    #[error("not enabled: {0}")]
    NotEnabled(String),

    /// Publishing was refused by the channel allow-list.
    #[error("channel disabled: {0}")]
    ChannelDisabled(String),

    /// A request did not receive a reply in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Configuration could not be read, parsed, or validated.
    #[error("config error: {0}")]
    Config(String),

    /// Record store failure.
    #[error("store error: {0}")]
    Store(String),

    /// The component has been shut down.
    #[error("shut down: {0}")]
    Shutdown(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TaskbusError>;
