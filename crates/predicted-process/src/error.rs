//! Error types for predicted process runs

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::process::ProcessId;

/// Why a single run of a predicted process failed.
///
/// Cloneable so that a memoized run can hand the same failure to every
/// caller replaying it.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    /// The signal was already cancelled when `run` was called; nothing was spawned
    #[error("Signal already cancelled before dispatch")]
    AlreadyCancelled,

    /// The OS process could not be started
    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] Arc<io::Error>),

    /// The process exited with a non-zero code or was killed by an OS signal
    #[error("Process exited with code {code:?} and signal {signal:?}")]
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// The signal was cancelled while the run was outstanding
    #[error("Signal cancelled during execution")]
    Cancelled,
}

impl RunError {
    pub(crate) fn spawn(err: io::Error) -> Self {
        Self::Spawn(Arc::new(err))
    }
}

/// Process management errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// One or more members of a batch failed
    #[error("{} of {total} processes failed", .failures.len())]
    BatchFailed {
        total: usize,
        failures: Vec<(ProcessId, RunError)>,
    },

    /// Invalid configuration
    #[error("Invalid process configuration: {0}")]
    InvalidConfig(String),

    /// Configuration sources could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
