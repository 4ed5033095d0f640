//! Core domain types for the logship shipping subsystem.
//!
//! Provides the structured log entry record, the durable store contract used
//! to absorb remote outages, the de-duplicating diagnostic sink, and
//! process-wide identity published to downstream collectors. The delivery and
//! server crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod entry;
pub mod globals;
pub mod log_once;
pub mod store;
pub mod time;

pub use entry::{LogEntry, LogLevel};
pub use globals::{deployment_id, service_version, set_deployment_id, set_service_version};
pub use log_once::{DedupLogger, LogOnce, NoopLogger};
pub use store::{DirStore, EntryStore, StoreError};
pub use time::{Clock, RealClock};
