//! Exponential backoff policy for failed deliveries.
//!
//! The delay for a failure that brings the counter to `n` is
//! `min(base_delay * 2^n, cap_delay)`, deterministic so the schedule can
//! be asserted exactly. Once the counter reaches `max_retries` the
//! decision flips to dead letter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts allowed before dead-lettering.
    pub max_retries: u32,

    /// Base delay for the exponential schedule.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub cap_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(300),
        }
    }
}

/// Result of a retry decision for one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt at the given time.
    Retry {
        /// When the next attempt becomes due.
        next_retry_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; move to the dead letter queue.
    DeadLetter {
        /// Reason recorded with the terminal move.
        reason: String,
    },
}

impl RetryPolicy {
    /// Delay before the attempt following failure number `retry_count`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        std::cmp::min(self.base_delay.saturating_mul(multiplier), self.cap_delay)
    }

    /// Decides the fate of a delivery whose failure counter just reached
    /// `retry_count`.
    pub fn decide(&self, retry_count: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::DeadLetter {
                reason: format!("retry budget exhausted after {retry_count} attempts"),
            };
        }

        let delay = chrono::Duration::from_std(self.backoff_delay(retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.cap_delay.as_secs() as i64));
        RetryDecision::Retry { next_retry_at: failed_at + delay }
    }
}
