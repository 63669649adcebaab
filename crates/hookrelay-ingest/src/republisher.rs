//! Publish recovery sweep.
//!
//! The broker holds envelopes in memory only, so an event that committed
//! right before a crash, or whose post-commit publish failed, sits in
//! `received` with nobody working on it. This loop periodically scans for
//! such events and publishes them again. Re-announcing an event that is
//! merely slow is harmless: fan-out claims and delivery rows are
//! idempotent.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use hookrelay_core::{broker::Broker, EventEnvelope, EventStore};
use tokio_util::sync::CancellationToken;

/// Publish recovery configuration.
#[derive(Debug, Clone)]
pub struct RepublisherConfig {
    /// Interval between sweeps.
    pub sweep_interval: Duration,
    /// Minimum age before a `received` event counts as stranded.
    ///
    /// Must comfortably exceed normal publish-to-claim latency, or the
    /// sweep will re-announce events that are simply queued.
    pub min_age: Duration,
    /// Maximum events republished per sweep.
    pub batch_size: i64,
}

impl Default for RepublisherConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            min_age: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// Background loop re-announcing stranded `received` events.
pub struct Republisher {
    store: Arc<dyn EventStore>,
    broker: Arc<dyn Broker>,
    config: RepublisherConfig,
    cancel: CancellationToken,
}

impl Republisher {
    /// Creates a republisher over the given store and broker.
    pub fn new(
        store: Arc<dyn EventStore>,
        broker: Arc<dyn Broker>,
        config: RepublisherConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self { store, broker, config, cancel }
    }

    /// Runs until cancelled. Cancellation is observed between sweeps.
    pub async fn run(self) {
        tracing::info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            min_age_ms = self.config.min_age.as_millis() as u64,
            "publish recovery started"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.sweep_interval) => {},
            }

            self.sweep().await;
        }

        tracing::info!("publish recovery stopped");
    }

    /// Scans once and republishes every stranded event found.
    pub async fn sweep(&self) {
        let min_age = chrono::Duration::from_std(self.config.min_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = Utc::now() - min_age;

        let stranded = match self.store.stale_received_events(cutoff, self.config.batch_size).await
        {
            Ok(stranded) => stranded,
            Err(e) => {
                tracing::warn!(error = %e, "publish recovery scan failed");
                return;
            },
        };

        if stranded.is_empty() {
            return;
        }
        tracing::warn!(count = stranded.len(), "republishing stranded events");

        for raw in stranded {
            let envelope = EventEnvelope::from_raw(&raw);
            let key = raw.key();
            if let Err(e) = self.broker.publish(envelope).await {
                tracing::error!(event_key = %key, error = %e, "republish failed");
                return;
            }
            tracing::info!(event_key = %key, "event republished");
        }
    }
}
