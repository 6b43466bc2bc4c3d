use thiserror::Error;

use crate::types::TaskState;

/// Top-level error type for the Exo embedding pipeline.
///
/// Structural failures (`DeviceUnavailable`, `IndexCorrupt`) abort the operation that raised
/// them. `StagingExhausted` and `TaskQueueFull` are signals the caller is expected to act on.
/// Per-item encode failures never surface here; they are reported as failure entries by the
/// embedding engine and only become `Encode` when a single-item call (a query) has nothing
/// left to return.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No usable compute device: {0}")]
    DeviceUnavailable(String),

    #[error("Staging area exhausted: requested {requested} bytes, {available} bytes available")]
    StagingExhausted { requested: u64, available: u64 },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Task queue full (capacity {capacity})")]
    TaskQueueFull { capacity: usize },

    #[error("Invalid task transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl ExoError {
    /// Whether the caller can reasonably retry later or route around the failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExoError::StagingExhausted { .. } | ExoError::TaskQueueFull { .. } | ExoError::Encode(_)
        )
    }
}

impl From<toml::de::Error> for ExoError {
    fn from(err: toml::de::Error) -> Self {
        ExoError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ExoError {
    fn from(err: toml::ser::Error) -> Self {
        ExoError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ExoError {
    fn from(err: serde_json::Error) -> Self {
        ExoError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Exo operations.
pub type Result<T> = std::result::Result<T, ExoError>;
