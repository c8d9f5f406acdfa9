//! Error types for pool and service operations

use nix::errno::Errno;
use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors returned by control operations on pools, queues and the service.
///
/// Work-item failures never show up here: they are contained on the
/// worker thread that ran the item and reported to the observer.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `start` called on a pool or service that is already running
    #[error("already started")]
    AlreadyStarted,

    /// Operation needs a running pool or service
    #[error("not running")]
    NotRunning,

    /// Shutdown has begun; no new work or growth is accepted
    #[error("shutting down")]
    ShuttingDown,

    /// The completion queue was closed
    #[error("completion queue closed")]
    QueueClosed,

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Argument combination is not allowed
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// OS thread could not be created
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// OS call failed
    #[error("OS error: {0}")]
    Os(#[from] Errno),
}

impl PoolError {
    /// True for errors caused by a missing or exhausted OS resource.
    pub fn is_resource_failure(&self) -> bool {
        matches!(self, PoolError::Spawn(_) | PoolError::Os(_))
    }
}
