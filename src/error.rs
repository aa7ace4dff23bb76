use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Errors that can occur while supervising processes
#[derive(Error, Debug)]
pub enum WardenError {
    /// The OS refused or failed to create the child process
    #[error("failed to spawn process '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// `start()` was called on a process that is already running
    #[error("process '{0}' is already running")]
    AlreadyRunning(String),

    /// Graceful termination did not complete within the bounded window.
    /// The OS process may still be alive.
    #[error("process '{id}' (pid {pid:?}) did not exit within {timeout:?}")]
    ShutdownTimeout {
        id: String,
        pid: Option<u32>,
        timeout: Duration,
    },

    /// A one-shot command exited with a non-zero code
    #[error("process '{id}' exited with an error: {stderr}")]
    CommandFailed { id: String, stderr: String },

    /// An id-based operation referenced an unregistered process id
    #[error("process '{0}' not found")]
    ProcessNotFound(String),

    /// The readiness failure predicate fired before the success predicate
    #[error("process '{id}' failed to become ready: {line}")]
    ReadinessFailure { id: String, line: String },

    /// The process exited before it became ready
    #[error("process '{id}' exited before becoming ready")]
    ExitedBeforeReady { id: String },

    /// Delivering a signal to the child failed at the OS level
    #[error("failed to signal process '{id}': {source}")]
    Signal {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
