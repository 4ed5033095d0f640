//! Process-wide identity published to remote collectors.
//!
//! The service version and deployment id are stamped on every outbound
//! delivery. Both are set exactly once during boot, before the first request
//! is served; `OnceLock` provides the happens-before publication so readers
//! need no synchronization.

use std::sync::OnceLock;

static SERVICE_VERSION: OnceLock<String> = OnceLock::new();
static DEPLOYMENT_ID: OnceLock<String> = OnceLock::new();

/// Header carrying the service version on outbound deliveries.
pub const VERSION_HEADER: &str = "x-logship-version";

/// Header carrying the deployment id on outbound deliveries.
pub const DEPLOYMENT_ID_HEADER: &str = "x-logship-deployment-id";

/// Publishes the service version. Later calls are ignored.
pub fn set_service_version(version: impl Into<String>) {
    let _ = SERVICE_VERSION.set(version.into());
}

/// Publishes the deployment id. Later calls are ignored.
pub fn set_deployment_id(id: impl Into<String>) {
    let _ = DEPLOYMENT_ID.set(id.into());
}

/// Returns the published service version, or a placeholder before boot
/// finishes publishing it.
pub fn service_version() -> &'static str {
    SERVICE_VERSION.get().map_or("dev", String::as_str)
}

/// Returns the published deployment id, or an empty string before boot.
pub fn deployment_id() -> &'static str {
    DEPLOYMENT_ID.get().map_or("", String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_wins() {
        set_service_version("2026-08-01T00-00-00Z");
        set_service_version("ignored");
        assert_eq!(service_version(), "2026-08-01T00-00-00Z");
    }
}
