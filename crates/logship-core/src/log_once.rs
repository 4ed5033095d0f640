//! De-duplicating diagnostic sink.
//!
//! Delivery failures repeat at high frequency while a remote is down; logging
//! every retry would drown the console. `LogOnce` implementations emit an
//! error the first time it is seen for a given key and suppress repeats until
//! the error text changes for that key.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::error;

/// Sink for repeated delivery errors, de-duplicated per key.
///
/// The key is typically the remote endpoint, so each endpoint reports its
/// current failure mode once rather than once per attempt.
pub trait LogOnce: Send + Sync {
    /// Records `err` for `key`, emitting it only when it differs from the
    /// last error recorded for that key.
    fn log_once(&self, key: &str, err: &dyn std::fmt::Display);
}

/// `LogOnce` implementation backed by `tracing`.
#[derive(Debug, Default)]
pub struct DedupLogger {
    seen: Mutex<HashMap<String, String>>,
}

impl DedupLogger {
    /// Creates an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared handle, the shape targets store in their config.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Records `message` for `key`; returns whether it should be emitted
    /// (first sighting, or the message changed since the last one).
    fn record(&self, key: &str, message: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match seen.get(key) {
            Some(last) if last == message => false,
            _ => {
                seen.insert(key.to_string(), message.to_string());
                true
            }
        }
    }
}

impl LogOnce for DedupLogger {
    fn log_once(&self, key: &str, err: &dyn std::fmt::Display) {
        let message = err.to_string();
        if self.record(key, &message) {
            error!(key, error = %message, "delivery error");
        }
    }
}

/// Sink that drops everything. Used by tests and by callers that do their own
/// reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl LogOnce for NoopLogger {
    fn log_once(&self, _key: &str, _err: &dyn std::fmt::Display) {}
}
