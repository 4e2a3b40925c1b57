//! Error types for child process management

use std::io;
use thiserror::Error;

/// Child process errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// An argument or environment entry was rejected before spawning
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The OS refused to start the process (not found, permission denied, bad cwd)
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[from] io::Error),

    /// Writing to the child's stdin failed
    #[error("Failed to write to stdin: {0}")]
    WriteFailed(String),

    /// Stdin was used after it had been closed
    #[error("Invalid stdin state: {0}")]
    InvalidState(String),

    /// The process driver stopped before the process finished
    #[error("Process driver stopped before the process exited")]
    Aborted,
}

/// Result type for child process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
