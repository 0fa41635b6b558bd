//! Error types for process management

use std::io;
use thiserror::Error;

/// Process management errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The OS refused to start the process
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[from] io::Error),

    /// Spawned, but the OS reported no PID (already reaped)
    #[error("Spawned process has no PID")]
    MissingPid,

    /// Signal delivery or reaping failed
    #[error("Failed to kill process: {0}")]
    KillFailed(String),
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
