//! Error types for linepool-core.

use thiserror::Error;

/// Result type for linepool-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in linepool-core.
#[derive(Debug, Error)]
pub enum Error {
    /// No run with this id is registered in the tracker.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// A run was registered twice under the same id.
    #[error("run already exists: {0}")]
    DuplicateRun(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A persistence sink rejected a record.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cache store failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// Flow definition could not be turned into an executor.
    #[error("invalid flow: {0}")]
    InvalidFlow(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
