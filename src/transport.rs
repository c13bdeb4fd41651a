//! Delivery of event batches to the collector.

use crate::error::{ConfigError, DeliveryError};
use crate::event::TrackEvent;
use crate::ids::{DeviceFingerprint, SessionId};
use reqwest::Url;
use serde::Deserialize;
use std::future::Future;

/// Identity headers sent with every batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryContext {
    pub session_id: SessionId,
    pub device_fingerprint: DeviceFingerprint,
}

/// Sends one batch. The tracker spawns each call as a detached task and requeues the
/// batch when the returned future resolves to an error.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        events: &[TrackEvent],
        context: &DeliveryContext,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Collector acknowledgement. Older collectors reply with an empty body.
#[derive(Debug, Default, Deserialize)]
struct BatchAck {
    #[serde(default)]
    processed: Option<u64>,
    #[serde(default)]
    invalid: Option<u64>,
}

/// `POST <endpoint>` with a JSON array body.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    /// `endpoint` must be an absolute `http(s)` URL.
    pub fn new(endpoint: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_url(url)
    }

    /// Resolve a relative endpoint such as `/api/tracking/batch` against the site origin.
    pub fn with_base(base: &str, endpoint: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason,
        };
        let base = Url::parse(base).map_err(|e| invalid(format!("base url: {e}")))?;
        let url = base.join(endpoint).map_err(|e| invalid(e.to_string()))?;
        Self::from_url(url)
    }

    fn from_url(endpoint: Url) -> Result<Self, ConfigError> {
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: format!("unsupported scheme {}", endpoint.scheme()),
            });
        }
        // No request timeout: a hung request only delays the requeue.
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    async fn send(&self, events: &[TrackEvent], context: &DeliveryContext) -> Result<(), DeliveryError> {
        if events.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_vec(events)?;
        let bytes = body.len();

        let resp = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-Session-ID", context.session_id.as_str())
            .header("X-Device-Fingerprint", context.device_fingerprint.as_str())
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }

        let ack: BatchAck = serde_json::from_str(&text).unwrap_or_default();
        if ack.invalid.unwrap_or(0) > 0 {
            tracing::warn!(invalid = ack.invalid, processed = ack.processed, "collector dropped invalid events");
        }
        tracing::debug!(events = events.len(), bytes, status = status.as_u16(), "delivered batch");
        Ok(())
    }
}
