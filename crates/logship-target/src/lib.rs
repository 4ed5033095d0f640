//! Webhook delivery target for structured log entries.
//!
//! Forwards JSON-encoded entries over HTTP(S) to a remote collector,
//! absorbing transient remote failures without losing events and without
//! blocking producers.
//!
//! # Delivery architecture
//!
//! ```text
//!  producers ──▶ WebhookTarget::send
//!                      │
//!            queue_dir set?  ──────────── yes ──▶ DirStore ──▶ replay loop
//!                      │ no                                        │
//!                      ▼                                           ▼
//!              bounded channel ──▶ elastic worker pool ──▶ WebhookClient ──▶ remote
//!                                  (1..=16 workers,
//!                                   grown on demand)
//! ```
//!
//! Enqueueing is strictly non-blocking: a full buffer either grows the pool
//! (bounded, rate-limited) or drops the entry and tells the producer. All
//! network failures are retried with bounded backoff inside the workers and
//! reported through a de-duplicating diagnostic sink.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

pub mod client;
pub mod config;
pub mod error;
mod replay;
mod target;

pub use client::WebhookClient;
pub use config::{TargetConfig, WebhookSettings, DEFAULT_QUEUE_SIZE};
pub use error::{Result, TargetError};
pub use target::{TargetStats, WebhookTarget};

/// Timeout applied to every webhook call, liveness probes and entry
/// deliveries alike.
pub const WEBHOOK_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of concurrent delivery workers per target.
pub const MAX_WORKERS: usize = 16;

/// Delivery attempts per entry before it is abandoned.
pub const MAX_SEND_RETRIES: u32 = 10;

/// File extension of persisted entries in the durable queue store.
pub const HTTP_LOG_EXTENSION: &str = ".http.log";
