//! Webhook target configuration.
//!
//! Targets are described by a flat key set (`endpoint`, `auth_token`,
//! `client_cert`/`client_key`, `queue_size`, `queue_dir`, `proxy`) supplied
//! by the service configuration layer. `WebhookSettings::load` merges
//! `config.toml` with `LOGSHIP_WEBHOOK_*` environment overrides; programmatic
//! construction is equally supported.

use std::{collections::BTreeMap, path::PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TargetError};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "LOGSHIP_WEBHOOK_";

/// Default capacity of the in-memory buffer and the durable store.
pub const DEFAULT_QUEUE_SIZE: usize = 100_000;

/// Configuration of a single webhook target.
///
/// Immutable once handed to [`crate::WebhookTarget::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Whether the configuration layer enables this target.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Target name, used in diagnostics and as the queue subdirectory.
    #[serde(default)]
    pub name: String,

    /// Remote collector URL. Required.
    #[serde(default)]
    pub endpoint: String,

    /// Value sent verbatim in the `Authorization` header when non-empty.
    #[serde(default)]
    pub auth_token: String,

    /// `User-Agent` presented to the collector.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// PEM client certificate for mutual TLS. Paired with `client_key`.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,

    /// PEM client key for mutual TLS. Paired with `client_cert`.
    #[serde(default)]
    pub client_key: Option<PathBuf>,

    /// Capacity of the in-memory buffer, or of the durable store in queue-dir
    /// mode. Must be positive.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Directory for the durable store. Setting this switches the target to
    /// durable mode.
    #[serde(default)]
    pub queue_dir: Option<PathBuf>,

    /// Outbound proxy URL for deliveries.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Prebuilt HTTP client, used instead of constructing one from the fields
    /// above. The client is used as-is and never mutated; combining it with
    /// `proxy` is a configuration error.
    #[serde(skip)]
    pub transport: Option<reqwest::Client>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            name: String::new(),
            endpoint: String::new(),
            auth_token: String::new(),
            user_agent: default_user_agent(),
            client_cert: None,
            client_key: None,
            queue_size: default_queue_size(),
            queue_dir: None,
            proxy: None,
            transport: None,
        }
    }
}

impl TargetConfig {
    /// Checks the configuration for fatal problems.
    ///
    /// # Errors
    ///
    /// Returns `TargetError::Config` when the endpoint is missing or
    /// unparsable, the queue size is zero, only one half of the client
    /// cert/key pair is set, or the proxy URL is unparsable.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(TargetError::configuration("endpoint must not be empty"));
        }
        Url::parse(&self.endpoint)
            .map_err(|e| TargetError::configuration(format!("invalid endpoint '{}': {e}", self.endpoint)))?;

        if self.queue_size == 0 {
            return Err(TargetError::configuration("queue_size must be greater than 0"));
        }

        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err(TargetError::configuration(
                "client_cert and client_key must both be set or both be empty",
            ));
        }

        if let Some(proxy) = &self.proxy {
            Url::parse(proxy)
                .map_err(|e| TargetError::configuration(format!("invalid proxy '{proxy}': {e}")))?;
        }

        Ok(())
    }

    /// Parsed endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns `TargetError::Config` when the endpoint does not parse.
    pub fn endpoint_url(&self) -> Result<Url> {
        Url::parse(&self.endpoint)
            .map_err(|e| TargetError::configuration(format!("invalid endpoint '{}': {e}", self.endpoint)))
    }
}

/// All webhook targets known to the configuration layer, keyed by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Configured targets. Disabled entries are kept but skipped by
    /// [`WebhookSettings::enabled_targets`].
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

impl WebhookSettings {
    /// Loads settings from `config.toml` and `LOGSHIP_WEBHOOK_*` environment
    /// variables, environment taking precedence.
    ///
    /// Nested keys use `__` in the environment, for example
    /// `LOGSHIP_WEBHOOK_TARGETS__AUDIT__ENDPOINT`. Every enabled target is
    /// validated and given its map key as name when it does not carry one.
    ///
    /// # Errors
    ///
    /// Returns `TargetError::Config` when extraction or validation fails.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let mut settings: Self = figment
            .extract()
            .map_err(|e| TargetError::configuration(format!("failed to load webhook settings: {e}")))?;

        for (name, target) in &mut settings.targets {
            if target.name.is_empty() {
                target.name.clone_from(name);
            }
            if target.enabled {
                target.validate()?;
            }
        }
        Ok(settings)
    }

    /// Iterates over the enabled targets.
    pub fn enabled_targets(&self) -> impl Iterator<Item = &TargetConfig> {
        self.targets.values().filter(|t| t.enabled)
    }
}

fn default_enabled() -> bool {
    false
}

fn default_user_agent() -> String {
    format!("logship/{}", logship_core::service_version())
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}
