//! Clock abstraction for testable timing.
//!
//! Retry backoff and revive pacing sleep through a `Clock` so tests can
//! substitute a controllable implementation.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant},
};

/// Time source injected into delivery targets.
pub trait Clock: Send + Sync {
    /// Current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Sleeps for the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
