//! Polling scheduler for due delivery retries.
//!
//! Wakes on a fixed interval, pulls a bounded batch of failed deliveries
//! whose deadline has passed, and runs each through the executor with a
//! `failed -> processing` claim. Several scheduler instances can run
//! concurrently; the claim keeps every attempt exclusive.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use hookrelay_core::{DeliveryStatus, EventStore};
use tokio_util::sync::CancellationToken;

use crate::executor::DeliveryExecutor;

/// Retry scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between polls.
    pub poll_interval: Duration,
    /// Maximum deliveries claimed per poll.
    pub batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(2), batch_size: 10 }
    }
}

/// Background loop retrying failed deliveries when they come due.
pub struct RetryScheduler {
    store: Arc<dyn EventStore>,
    executor: Arc<DeliveryExecutor>,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl RetryScheduler {
    /// Creates a scheduler over the given store and executor.
    pub fn new(
        store: Arc<dyn EventStore>,
        executor: Arc<DeliveryExecutor>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self { store, executor, config, cancel }
    }

    /// Runs until cancelled. Cancellation is observed between polls and
    /// between batches, never mid-attempt.
    pub async fn run(self) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "retry scheduler started"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {},
            }

            self.run_batch().await;
        }

        tracing::info!("retry scheduler stopped");
    }

    /// Polls once and executes every due retry in the batch.
    ///
    /// One delivery's failure never affects the rest: executor errors
    /// are logged and the loop moves on.
    pub async fn run_batch(&self) {
        let due = match self.store.due_retries(Utc::now(), self.config.batch_size).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll due retries");
                return;
            },
        };

        if due.is_empty() {
            return;
        }
        tracing::debug!(count = due.len(), "retrying due deliveries");

        for task in due {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.executor.execute(&task, DeliveryStatus::Failed).await {
                tracing::error!(
                    delivery_id = %task.delivery_id,
                    error = %e,
                    "retry attempt could not be recorded"
                );
            }
        }
    }
}
