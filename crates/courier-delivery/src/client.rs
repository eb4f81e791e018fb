//! HTTP client for delivery attempts.
//!
//! Thin wrapper around `reqwest` that turns an attempt into either a 2xx
//! response or a classified [`DeliveryError`]. Every attempt carries a hard
//! timeout so a slow endpoint can never stall a worker indefinitely.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, instrument};

use crate::error::{DeliveryError, Result};

/// HTTP client configuration for delivery attempts.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hard per-attempt timeout.
    pub timeout: Duration,
    /// User-Agent header sent with every attempt.
    pub user_agent: String,
    /// Maximum redirects to follow.
    pub max_redirects: usize,
    /// Whether to verify TLS certificates. Only disabled in tests.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Courier/0.1".to_string(),
            max_redirects: 5,
            verify_tls: true,
        }
    }
}

/// One delivery attempt, ready to send.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Endpoint URL to post to.
    pub url: String,
    /// Source the payload came from, sent as `X-Courier-Source`.
    pub source_id: String,
    /// Payload shape tag, sent as `X-Courier-Event`.
    pub event_type: String,
    /// Headers from the binding, auth already materialized.
    pub headers: Vec<(String, String)>,
    /// JSON payload body.
    pub payload: serde_json::Value,
}

/// A successful (2xx) delivery response.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status: u16,
}

/// HTTP client used by delivery workers and reconnect probes.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl DeliveryClient {
    /// Builds a client from configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build client: {e}")))?;

        Ok(Self { client, timeout: config.timeout })
    }

    /// Posts the payload and classifies the outcome.
    #[instrument(skip(self, request), fields(url = %request.url, event_type = %request.event_type))]
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse> {
        let headers = build_header_map(request)?;

        let response = self
            .client
            .post(&request.url)
            .headers(headers)
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::timeout(self.timeout.as_secs())
                } else {
                    DeliveryError::network(e.to_string())
                }
            })?;

        let status = response.status();
        debug!(status = status.as_u16(), "delivery attempt completed");

        if status.is_success() {
            return Ok(DeliveryResponse { status: status.as_u16() });
        }

        if status.as_u16() == 429 {
            return Err(DeliveryError::rate_limited(extract_retry_after_seconds(&response)));
        }

        let code = status.as_u16();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(256).collect();
            return Err(DeliveryError::endpoint_rejected(code, snippet));
        }

        Err(DeliveryError::endpoint_failed(code))
    }
}

fn build_header_map(request: &DeliveryRequest) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    let source = HeaderValue::from_str(&request.source_id)
        .map_err(|e| DeliveryError::configuration(format!("invalid source id header: {e}")))?;
    let event = HeaderValue::from_str(&request.event_type)
        .map_err(|e| DeliveryError::configuration(format!("invalid event type header: {e}")))?;
    headers.insert("x-courier-source", source);
    headers.insert("x-courier-event", event);

    for (name, value) in &request.headers {
        let name = name
            .parse::<HeaderName>()
            .map_err(|e| DeliveryError::configuration(format!("invalid header {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            DeliveryError::configuration(format!("invalid value for header {name}: {e}"))
        })?;
        headers.insert(name, value);
    }

    Ok(headers)
}

fn extract_retry_after_seconds(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}
