//! Error types for the server lifecycle.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Failures surfaced by server init and shutdown.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server was never started or is already shutting down. Also the
    /// body served to requests arriving during shutdown.
    #[error("server closed")]
    Closed,

    /// None of the configured addresses could be bound.
    #[error("no available interface found")]
    NoInterface,

    /// In-flight requests outlived the shutdown timeout.
    #[error("shutdown timed out; some connections are still active")]
    ShutdownTimeout,

    /// In-flight requests outlived the shutdown timeout; a task inventory
    /// was written for diagnosis.
    #[error("shutdown timed out; some connections are still active, task inventory written to {}", .path.display())]
    ShutdownTimeoutWithDump {
        /// Location of the dumped task inventory.
        path: PathBuf,
    },

    /// Listener-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Whether this error reports an exceeded shutdown deadline.
    pub fn is_shutdown_timeout(&self) -> bool {
        matches!(self, Self::ShutdownTimeout | Self::ShutdownTimeoutWithDump { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_variants_identified() {
        assert!(ServerError::ShutdownTimeout.is_shutdown_timeout());
        assert!(ServerError::ShutdownTimeoutWithDump { path: PathBuf::from("/tmp/t.txt") }
            .is_shutdown_timeout());
        assert!(!ServerError::Closed.is_shutdown_timeout());
    }

    #[test]
    fn dump_path_included_in_message() {
        let err = ServerError::ShutdownTimeoutWithDump { path: PathBuf::from("/tmp/tasks.txt") };
        assert!(err.to_string().contains("/tmp/tasks.txt"));
    }
}
