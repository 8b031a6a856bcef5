//! Error types for linepool.

use linepool_core::ErrorInfo;
use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Pool-level failures. These abort `start()`, `run()` or `submit()`.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Workers did not become healthy; no partial pool is left running.
    #[error("failed to start worker pool: {0}")]
    Startup(String),

    /// A killed worker was still alive after the termination timeout.
    #[error("Process {pid} has not terminated after {timeout} seconds")]
    ProcessTerminatedTimeout { pid: u32, timeout: u64 },

    /// A (re)started worker never reported ready.
    #[error("Failed to get process info of slot {index} after {timeout} seconds")]
    ProcessInfoObtainedTimeout { index: usize, timeout: u64 },

    /// A monitor thread stopped with an error or panicked.
    #[error("The monitor thread in the process pool crashed. Error: {0}")]
    ThreadCrash(String),

    /// Invalid configuration or environment override.
    #[error("configuration error: {0}")]
    Config(String),

    /// The pool was used before `start()` or after `close()`.
    #[error("pool is not running")]
    NotRunning,

    /// IPC communication error with a worker or the fork server.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Any other monitor-loop fault.
    #[error("unexpected error: {0}")]
    Unexpected(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the executor layer.
    #[error(transparent)]
    Core(#[from] linepool_core::Error),
}

/// Why the pool gave up on a single line.
///
/// These never escape `run()` or `submit()`; they are folded into a failed
/// `LineResult`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("Process crashed while executing line {line_number}.")]
    ProcessCrash { line_number: usize },

    #[error("Line {line_number} execution timeout for exceeding {timeout} seconds")]
    LineTimeout { line_number: usize, timeout: u64 },

    #[error(
        "Line {line_number} execution terminated due to the total batch run exceeding the batch timeout ({timeout}s)."
    )]
    BatchTimeout { line_number: usize, timeout: u64 },

    #[error("Unexpected error occurred while monitoring line execution at line {line_number}: {message}")]
    Unexpected { line_number: usize, message: String },
}

impl LineError {
    /// Taxonomy name recorded on the failed line run.
    pub fn error_type(&self) -> &'static str {
        match self {
            LineError::ProcessCrash { .. } => "ProcessCrashError",
            LineError::LineTimeout { .. } => "LineExecutionTimeoutError",
            LineError::BatchTimeout { .. } => "BatchExecutionTimeoutError",
            LineError::Unexpected { .. } => "UnexpectedError",
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.error_type(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_error_messages() {
        let timeout = LineError::LineTimeout {
            line_number: 3,
            timeout: 600,
        };
        assert_eq!(
            timeout.to_string(),
            "Line 3 execution timeout for exceeding 600 seconds"
        );
        assert_eq!(timeout.error_type(), "LineExecutionTimeoutError");

        let batch = LineError::BatchTimeout {
            line_number: 1,
            timeout: 2,
        };
        assert_eq!(
            batch.to_error_info().message,
            "Line 1 execution terminated due to the total batch run exceeding the batch timeout (2s)."
        );
        assert_eq!(batch.to_error_info().error_type, "BatchExecutionTimeoutError");
    }
}
