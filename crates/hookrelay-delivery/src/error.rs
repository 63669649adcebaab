//! Error types for delivery execution.

use thiserror::Error;

/// Result type alias using `DeliveryError`.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Delivery attempt failures.
///
/// Attempt-level variants (`Network`, `Timeout`, `HttpStatus`) feed the
/// backoff policy as the recorded failure reason. `Store` means the
/// attempt could not be recorded at all and is propagated to the caller
/// instead of consuming retry budget.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection-level failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded the configured timeout.
    #[error("request timed out after {timeout_secs}s")]
    Timeout {
        /// Timeout that was exceeded, in seconds.
        timeout_secs: u64,
    },

    /// Destination answered with a non-2xx status.
    #[error("destination returned status {status}")]
    HttpStatus {
        /// HTTP status code returned.
        status: u16,
    },

    /// HTTP client could not be constructed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// State store operation failed.
    #[error("store error: {0}")]
    Store(#[from] hookrelay_core::CoreError),
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Creates a timeout error.
    pub const fn timeout(timeout_secs: u64) -> Self {
        Self::Timeout { timeout_secs }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
