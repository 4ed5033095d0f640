//! Error types for webhook delivery.
//!
//! Classifies delivery failures so callers can distinguish transient network
//! conditions (retried, and treated as "remote offline" by the liveness
//! check) from remote rejections (the endpoint answered, just unhappily) and
//! local conditions such as a saturated buffer or a cancelled target.

use logship_core::StoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, TargetError>;

/// Failures surfaced by the webhook target.
#[derive(Debug, Error)]
pub enum TargetError {
    /// Target configuration is unusable; the target never comes online.
    #[error("invalid webhook target configuration: {message}")]
    Config {
        /// What was wrong with the configuration.
        message: String,
    },

    /// Connection-level failure reaching the endpoint.
    #[error("{endpoint} returned '{message}', please check your endpoint configuration")]
    Network {
        /// Endpoint that was dialed.
        endpoint: String,
        /// Underlying transport error.
        message: String,
    },

    /// The request did not complete within the webhook call timeout.
    #[error("request to {endpoint} timed out")]
    Timeout {
        /// Endpoint that was dialed.
        endpoint: String,
    },

    /// The endpoint rejected the configured credentials (HTTP 403).
    #[error("{endpoint} returned '{status}', please check if your auth token is correctly set")]
    Auth {
        /// Endpoint that answered.
        endpoint: String,
        /// HTTP status line of the rejection.
        status: String,
    },

    /// The endpoint answered with an unexpected status.
    #[error("{endpoint} returned '{status}', please check your endpoint configuration")]
    RemoteRejected {
        /// Endpoint that answered.
        endpoint: String,
        /// HTTP status line of the rejection.
        status: String,
    },

    /// The in-memory buffer is full and the entry was dropped.
    #[error("{message}")]
    BufferFull {
        /// Why the entry could not be buffered.
        message: String,
    },

    /// Operation attempted on a cancelled target.
    #[error("target is closed")]
    Closed,

    /// Durable store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Entry could not be serialized to JSON.
    #[error("entry serialization failed: {message}")]
    Serialization {
        /// Serializer error text.
        message: String,
    },
}

impl TargetError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Creates a network error for the given endpoint.
    pub fn network(endpoint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Network { endpoint: endpoint.into(), message: err.to_string() }
    }

    /// Creates a timeout error for the given endpoint.
    pub fn timeout(endpoint: impl Into<String>) -> Self {
        Self::Timeout { endpoint: endpoint.into() }
    }

    /// Creates an authentication error from an HTTP 403 response.
    pub fn auth(endpoint: impl Into<String>, status: impl Into<String>) -> Self {
        Self::Auth { endpoint: endpoint.into(), status: status.into() }
    }

    /// Creates a rejection error from an unexpected HTTP status.
    pub fn remote_rejected(endpoint: impl Into<String>, status: impl Into<String>) -> Self {
        Self::RemoteRejected { endpoint: endpoint.into(), status: status.into() }
    }

    /// Buffer-full error while the remote is unreachable.
    pub fn buffer_full_offline() -> Self {
        Self::BufferFull { message: "log buffer full and remote offline".to_string() }
    }

    /// Buffer-full error while every worker slot is in use.
    pub fn buffer_full_saturated() -> Self {
        Self::BufferFull {
            message: "log buffer full, remote endpoint is not able to keep up".to_string(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization { message: err.to_string() }
    }

    /// Whether this failure means the remote could not be reached at all.
    ///
    /// Liveness checks treat everything else as "online": a 403 or 500 still
    /// proves the remote is answering.
    pub fn is_network_or_host_down(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_conditions_identified() {
        assert!(TargetError::network("http://sink", "connection refused").is_network_or_host_down());
        assert!(TargetError::timeout("http://sink").is_network_or_host_down());

        assert!(!TargetError::auth("http://sink", "403 Forbidden").is_network_or_host_down());
        assert!(!TargetError::remote_rejected("http://sink", "500").is_network_or_host_down());
        assert!(!TargetError::buffer_full_offline().is_network_or_host_down());
        assert!(!TargetError::Closed.is_network_or_host_down());
    }

    #[test]
    fn auth_error_hints_at_token() {
        let err = TargetError::auth("http://sink/logs", "403 Forbidden");
        assert!(err.to_string().contains("auth token"));
    }

    #[test]
    fn buffer_full_messages_distinguish_cause() {
        assert!(TargetError::buffer_full_offline().to_string().contains("remote offline"));
        assert!(TargetError::buffer_full_saturated().to_string().contains("not able to keep up"));
    }
}
