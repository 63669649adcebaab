//! Provider signature verifiers.
//!
//! Closed set: one variant per supported provider, each owning its
//! signature scheme and its way of extracting the event identity from
//! the request. Looking up a verifier for an unknown provider name is an
//! explicit error, never a pass-through.

use std::collections::HashMap;

use chrono::Utc;
use hookrelay_core::Provider;
use thiserror::Error;

use crate::crypto::{generate_hmac_hex, timing_safe_eq};

/// Stripe rejects signatures whose timestamp drifts more than this from
/// the receiving clock.
pub const DEFAULT_STRIPE_TOLERANCE_SECS: i64 = 300;

/// Signature verification failures.
///
/// All variants are deterministic rejections; none of them warrant a
/// retry by the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// Provider name has no registered verifier.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Required header was absent.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// Signature header present but unparseable.
    #[error("invalid signature format: {0}")]
    InvalidFormat(String),

    /// Computed HMAC did not match any presented signature.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// Signed timestamp outside the accepted tolerance window.
    #[error("signature timestamp outside tolerance: {skew_secs}s")]
    TimestampOutOfTolerance {
        /// Observed absolute skew in seconds.
        skew_secs: i64,
    },

    /// Secret key rejected by the MAC implementation.
    #[error("invalid secret key")]
    InvalidSecret,

    /// Body failed to parse or lacked the provider's identity fields.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// A webhook that passed signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEvent {
    /// Provider-assigned event identifier.
    pub event_id: String,
    /// Provider event type, when the provider exposes one.
    pub event_type: Option<String>,
    /// Parsed JSON payload.
    pub payload: serde_json::Value,
}

/// Signature verifier for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verifier {
    /// Stripe `Stripe-Signature: t=...,v1=...` over `"{t}.{body}"`.
    Stripe {
        /// Accepted timestamp skew in seconds.
        tolerance_secs: i64,
    },
    /// GitHub `X-Hub-Signature-256: sha256=<hex>` over the raw body.
    Github,
}

impl Verifier {
    /// Returns the verifier for a known provider.
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::Stripe => {
                Self::Stripe { tolerance_secs: DEFAULT_STRIPE_TOLERANCE_SECS }
            },
            Provider::Github => Self::Github,
        }
    }

    /// Resolves a verifier from a provider name, e.g. a URL path segment.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::UnsupportedProvider`] for names outside the
    /// closed provider set.
    pub fn from_tag(tag: &str) -> Result<Self, VerifyError> {
        let provider: Provider =
            tag.parse().map_err(|_| VerifyError::UnsupportedProvider(tag.to_string()))?;
        Ok(Self::for_provider(provider))
    }

    /// The provider this verifier belongs to.
    pub fn provider(&self) -> Provider {
        match self {
            Self::Stripe { .. } => Provider::Stripe,
            Self::Github => Provider::Github,
        }
    }

    /// Verifies a raw webhook body against its headers.
    ///
    /// Verification always runs over the exact received bytes; the JSON
    /// payload is only parsed after the signature checks out.
    ///
    /// # Errors
    ///
    /// Returns a [`VerifyError`] describing the first check that failed.
    pub fn verify(
        &self,
        body: &[u8],
        headers: &HashMap<String, String>,
        secret: &str,
    ) -> Result<VerifiedEvent, VerifyError> {
        match self {
            Self::Stripe { tolerance_secs } => {
                verify_stripe(body, headers, secret, *tolerance_secs)
            },
            Self::Github => verify_github(body, headers, secret),
        }
    }
}

fn header<'a>(
    headers: &'a HashMap<String, String>,
    name: &'static str,
) -> Result<&'a str, VerifyError> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
        .ok_or(VerifyError::MissingHeader(name))
}

fn parse_payload(body: &[u8]) -> Result<serde_json::Value, VerifyError> {
    serde_json::from_slice(body).map_err(|e| VerifyError::InvalidPayload(e.to_string()))
}

fn verify_stripe(
    body: &[u8],
    headers: &HashMap<String, String>,
    secret: &str,
    tolerance_secs: i64,
) -> Result<VerifiedEvent, VerifyError> {
    let signature_header = header(headers, "stripe-signature")?;

    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();
    for element in signature_header.split(',') {
        match element.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse().map_err(|_| {
                    VerifyError::InvalidFormat(format!("non-numeric timestamp: {value}"))
                })?);
            },
            Some(("v1", value)) => candidates.push(value),
            // Stripe sends v0 for legacy keys; ignore unknown schemes.
            Some(_) => {},
            None => {
                return Err(VerifyError::InvalidFormat(format!(
                    "expected k=v elements, got: {element}"
                )));
            },
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| VerifyError::InvalidFormat("missing t= element".to_string()))?;
    if candidates.is_empty() {
        return Err(VerifyError::InvalidFormat("missing v1= element".to_string()));
    }

    let body_str = std::str::from_utf8(body)
        .map_err(|_| VerifyError::InvalidPayload("body is not valid utf-8".to_string()))?;
    let signed_payload = format!("{timestamp}.{body_str}");
    let expected = generate_hmac_hex(signed_payload.as_bytes(), secret)?;

    if !candidates.iter().any(|candidate| timing_safe_eq(candidate, &expected)) {
        return Err(VerifyError::SignatureMismatch);
    }

    // Replay window check runs after the MAC so a forged timestamp
    // cannot probe the tolerance with an unsigned request.
    let skew_secs = (Utc::now().timestamp() - timestamp).abs();
    if skew_secs > tolerance_secs {
        return Err(VerifyError::TimestampOutOfTolerance { skew_secs });
    }

    let payload = parse_payload(body)?;
    let event_id = payload
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| VerifyError::InvalidPayload("missing id field".to_string()))?
        .to_string();
    let event_type = payload.get("type").and_then(|v| v.as_str()).map(str::to_string);

    Ok(VerifiedEvent { event_id, event_type, payload })
}

fn verify_github(
    body: &[u8],
    headers: &HashMap<String, String>,
    secret: &str,
) -> Result<VerifiedEvent, VerifyError> {
    let signature_header = header(headers, "x-hub-signature-256")?;
    let presented = signature_header.strip_prefix("sha256=").ok_or_else(|| {
        VerifyError::InvalidFormat(format!("expected sha256=<hex>, got: {signature_header}"))
    })?;

    let expected = generate_hmac_hex(body, secret)?;
    if !timing_safe_eq(presented, &expected) {
        return Err(VerifyError::SignatureMismatch);
    }

    let event_id = header(headers, "x-github-delivery")?.to_string();
    let event_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("x-github-event"))
        .map(|(_, v)| v.clone());
    let payload = parse_payload(body)?;

    Ok(VerifiedEvent { event_id, event_type, payload })
}
