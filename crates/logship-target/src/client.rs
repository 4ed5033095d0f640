//! HTTP sender for webhook deliveries.
//!
//! Stateless helper that POSTs one JSON-encoded entry per call with a
//! per-call timeout and classifies the response for the retry and liveness
//! logic. The response body is drained on every path so the underlying
//! connection can be reused.

use std::{fs, time::Duration};

use bytes::Bytes;
use logship_core::globals::{
    deployment_id, service_version, DEPLOYMENT_ID_HEADER, VERSION_HEADER,
};
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT},
    Identity, Proxy, StatusCode, Url,
};
use tracing::debug;

use crate::{
    config::TargetConfig,
    error::{Result, TargetError},
    WEBHOOK_CALL_TIMEOUT,
};

/// HTTP client bound to a single webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    endpoint: Url,
    user_agent: String,
    auth_token: Option<String>,
}

impl WebhookClient {
    /// Builds a client from the target configuration.
    ///
    /// Uses the injected transport verbatim when one is configured; otherwise
    /// constructs one, wiring in the client certificate pair and the outbound
    /// proxy. An injected transport is never mutated, so pairing it with a
    /// proxy is rejected rather than silently ignoring the proxy. Never
    /// contacts the network.
    ///
    /// # Errors
    ///
    /// Returns `TargetError::Config` when the endpoint or proxy URL does not
    /// parse, a proxy is combined with an injected transport, the certificate
    /// pair cannot be read, or the client cannot be constructed.
    pub fn from_config(config: &TargetConfig) -> Result<Self> {
        let endpoint = config.endpoint_url()?;

        let http = match &config.transport {
            Some(client) => {
                if config.proxy.is_some() {
                    return Err(TargetError::configuration(
                        "proxy cannot be applied to an injected transport",
                    ));
                }
                client.clone()
            }
            None => build_transport(config)?,
        };

        Ok(Self {
            http,
            endpoint,
            user_agent: config.user_agent.clone(),
            auth_token: (!config.auth_token.is_empty()).then(|| config.auth_token.clone()),
        })
    }

    /// Endpoint this client delivers to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// POSTs `payload` to the endpoint, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// - `TargetError::Timeout` / `TargetError::Network` when the remote
    ///   cannot be reached in time.
    /// - `TargetError::Auth` on HTTP 403.
    /// - `TargetError::RemoteRejected` on any other non-accepted status.
    pub async fn send(&self, payload: Bytes, timeout: Duration) -> Result<()> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, &self.user_agent)
            .header(VERSION_HEADER, service_version())
            .header(DEPLOYMENT_ID_HEADER, deployment_id());

        if let Some(token) = &self.auth_token {
            request = request.header(AUTHORIZATION, token);
        }

        let response = request.body(payload).send().await.map_err(|e| {
            if e.is_timeout() {
                TargetError::timeout(self.endpoint.as_str())
            } else {
                TargetError::network(self.endpoint.as_str(), &e)
            }
        })?;

        let status = response.status();
        // Drain whatever the remote sent back so the connection is reusable.
        let _ = response.bytes().await;

        match status {
            StatusCode::OK
            | StatusCode::CREATED
            | StatusCode::ACCEPTED
            | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::FORBIDDEN => {
                Err(TargetError::auth(self.endpoint.as_str(), status.to_string()))
            }
            _ => Err(TargetError::remote_rejected(self.endpoint.as_str(), status.to_string())),
        }
    }

    /// Probes the endpoint with an empty JSON object.
    ///
    /// The empty object is sent deliberately so collectors can tell probes
    /// from entries if they care to.
    ///
    /// # Errors
    ///
    /// Same classification as [`WebhookClient::send`].
    pub async fn check_alive(&self) -> Result<()> {
        self.send(Bytes::from_static(b"{}"), WEBHOOK_CALL_TIMEOUT).await
    }

    /// Whether the remote is considered reachable.
    ///
    /// A remote that answers at all counts as online, even with an error
    /// status; only connection-level failures count as down.
    pub async fn is_online(&self) -> bool {
        match self.check_alive().await {
            Ok(()) => true,
            Err(err) => {
                let online = !err.is_network_or_host_down();
                if !online {
                    debug!(endpoint = %self.endpoint, error = %err, "webhook endpoint unreachable");
                }
                online
            }
        }
    }
}

fn build_transport(config: &TargetConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();

    if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
        let mut pem = fs::read(cert).map_err(|e| {
            TargetError::configuration(format!("unable to read client_cert {}: {e}", cert.display()))
        })?;
        pem.extend(fs::read(key).map_err(|e| {
            TargetError::configuration(format!("unable to read client_key {}: {e}", key.display()))
        })?);
        let identity = Identity::from_pem(&pem)
            .map_err(|e| TargetError::configuration(format!("invalid client certificate pair: {e}")))?;
        builder = builder.identity(identity);
    }

    if let Some(proxy) = &config.proxy {
        builder = builder.proxy(
            Proxy::all(proxy.as_str())
                .map_err(|e| TargetError::configuration(format!("invalid proxy '{proxy}': {e}")))?,
        );
    }

    builder
        .build()
        .map_err(|e| TargetError::configuration(format!("failed to build HTTP client: {e}")))
}
