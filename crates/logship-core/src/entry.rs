//! Structured log entry record shipped to remote collectors.
//!
//! Producers inside the storage service emit `LogEntry` values; delivery
//! targets treat the entry as an opaque JSON-serializable payload, so custom
//! entry types can be shipped as well.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Informational message.
    Info,
    /// Something unexpected, service continues.
    Warning,
    /// Operation failed.
    Error,
    /// Service cannot continue.
    Fatal,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

/// A structured event forwarded to remote collectors.
///
/// Serialized to a single JSON object per delivery. Optional fields are
/// omitted from the wire format when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the event occurred.
    pub time: DateTime<Utc>,

    /// Severity of the event.
    pub level: LogLevel,

    /// Human-readable description.
    pub message: String,

    /// Subsystem or callsite that produced the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Request id the event belongs to, when produced inside a request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Free-form structured context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl LogEntry {
    /// Creates an entry with the given level and message, stamped with the
    /// current time.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            level,
            message: message.into(),
            source: None,
            request_id: None,
            fields: BTreeMap::new(),
        }
    }

    /// Sets the producing subsystem.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attaches a structured context field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_omitted_from_wire_format() {
        let entry = LogEntry::new(LogLevel::Info, "bucket created");
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["level"], "INFO");
        assert_eq!(json["message"], "bucket created");
        assert!(json.get("source").is_none());
        assert!(json.get("fields").is_none());
    }

    #[test]
    fn entry_roundtrips_with_context() {
        let entry = LogEntry::new(LogLevel::Error, "replication lag")
            .with_source("replication")
            .with_field("bucket", serde_json::json!("media"));

        let json = serde_json::to_string(&entry).unwrap();
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
