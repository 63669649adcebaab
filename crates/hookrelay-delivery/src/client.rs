//! HTTP client for signed webhook delivery.
//!
//! Builds the canonical delivery envelope, signs the serialized bytes
//! with the subscription secret, and POSTs them. The signed bytes and
//! the sent bytes are the same serialization, so receivers can verify
//! the signature over the body exactly as received.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use hookrelay_core::DeliveryTask;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signature header sent with every delivery.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
/// Event ID header sent with every delivery.
pub const EVENT_ID_HEADER: &str = "X-Webhook-Event-Id";
/// Provider header sent with every delivery.
pub const PROVIDER_HEADER: &str = "X-Webhook-Provider";

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-request timeout covering connect and response.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(5), user_agent: "hookrelay/1.0".to_string() }
    }
}

/// Canonical body POSTed to destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    /// Provider-assigned event identifier.
    pub id: String,
    /// Provider name.
    pub provider: String,
    /// Provider event type, omitted when unknown.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Verified payload snapshot.
    pub data: serde_json::Value,
    /// When this attempt was made.
    #[serde(rename = "deliveredAt")]
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryEnvelope {
    /// Builds the envelope for one delivery task.
    pub fn for_task(task: &DeliveryTask) -> Self {
        Self {
            id: task.event_id.clone(),
            provider: task.provider.to_string(),
            event_type: task.event_type.clone(),
            data: task.payload.clone(),
            delivered_at: Utc::now(),
        }
    }
}

/// HTTP client for webhook delivery.
///
/// Connection pooling comes from the shared `reqwest::Client`; one
/// instance serves every executor and the retry scheduler.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Attempts one delivery: serialize, sign, POST.
    ///
    /// # Errors
    ///
    /// - `Network` for connection failures
    /// - `Timeout` when the configured deadline elapses
    /// - `HttpStatus` for any non-2xx response
    pub async fn deliver(&self, task: &DeliveryTask) -> Result<()> {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %task.delivery_id,
            event_key = %task.key(),
            url = %task.target_url,
            attempt = task.retry_count + 1
        );

        async move {
            let envelope = DeliveryEnvelope::for_task(task);
            let body = serde_json::to_string(&envelope)
                .map_err(|e| DeliveryError::configuration(format!("envelope encode: {e}")))?;
            let signature = sign_payload(body.as_bytes(), &task.secret)?;

            let response = self
                .client
                .post(&task.target_url)
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, signature)
                .header(EVENT_ID_HEADER, &task.event_id)
                .header(PROVIDER_HEADER, task.provider.to_string())
                .body(body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        DeliveryError::timeout(self.config.timeout.as_secs())
                    } else if e.is_connect() {
                        DeliveryError::network(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::network(e.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                tracing::debug!(status = status.as_u16(), "destination acknowledged");
                Ok(())
            } else {
                tracing::warn!(status = status.as_u16(), "destination rejected delivery");
                Err(DeliveryError::HttpStatus { status: status.as_u16() })
            }
        }
        .instrument(span)
        .await
    }
}

/// Signs a payload with HMAC-SHA256, formatted as `sha256=<hex>`.
///
/// # Errors
///
/// Returns `DeliveryError::Configuration` if the secret is rejected.
pub fn sign_payload(payload: &[u8], secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| DeliveryError::configuration("invalid signing secret"))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
