//! Broker consumers driving fan-out, one task per partition.
//!
//! Each consumer drains its partition in order, so deliveries for one
//! event key are processed in publish order. A `Retry` outcome counts
//! against the event's redelivery budget and re-enqueues the envelope
//! after a short pause; an exhausted budget dead-letters the event
//! itself.

use std::{sync::Arc, time::Duration};

use hookrelay_core::{
    broker::Partition,
    EventEnvelope, EventStore,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::fanout::{FanoutOutcome, FanoutResolver};

/// Consumer pool configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Fan-out failures allowed per event before dead-lettering it.
    pub event_max_retries: u32,
    /// Pause before re-enqueueing a failed envelope.
    pub redelivery_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { event_max_retries: 5, redelivery_delay: Duration::from_secs(1) }
    }
}

/// Pool of partition consumer tasks.
pub struct ConsumerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ConsumerPool {
    /// Spawns one consumer task per partition.
    pub fn spawn(
        partitions: Vec<Partition>,
        resolver: Arc<FanoutResolver>,
        store: Arc<dyn EventStore>,
        config: ConsumerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let handles = partitions
            .into_iter()
            .map(|partition| {
                let resolver = Arc::clone(&resolver);
                let store = Arc::clone(&store);
                let config = config.clone();
                let cancel = cancel.clone();
                tokio::spawn(run_partition(partition, resolver, store, config, cancel))
            })
            .collect();

        Self { handles, cancel }
    }

    /// Number of consumer tasks in the pool.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true when the pool has no consumers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancels all consumers and waits for them to finish.
    ///
    /// Consumers finish their in-flight envelope first. Tasks still
    /// running after `timeout` are aborted.
    pub async fn shutdown_graceful(self, timeout: Duration) {
        self.cancel.cancel();

        let joined = tokio::time::timeout(timeout, async {
            for handle in self.handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        tracing::error!(error = %e, "consumer task panicked");
                    }
                }
            }
        })
        .await;

        if joined.is_err() {
            tracing::warn!("consumer shutdown timed out");
        }
    }
}

async fn run_partition(
    mut partition: Partition,
    resolver: Arc<FanoutResolver>,
    store: Arc<dyn EventStore>,
    config: ConsumerConfig,
    cancel: CancellationToken,
) {
    tracing::info!(partition = partition.index, "consumer started");

    loop {
        let envelope = tokio::select! {
            () = cancel.cancelled() => break,
            maybe = partition.recv() => match maybe {
                Some(envelope) => envelope,
                None => break,
            },
        };

        if let FanoutOutcome::Retry { reason } = resolver.resolve(&envelope).await {
            handle_retry(&partition, &store, &config, &cancel, envelope, reason).await;
        }
    }

    tracing::info!(partition = partition.index, "consumer stopped");
}

async fn handle_retry(
    partition: &Partition,
    store: &Arc<dyn EventStore>,
    config: &ConsumerConfig,
    cancel: &CancellationToken,
    envelope: EventEnvelope,
    reason: String,
) {
    let key = envelope.key();

    let retry_count = match store.record_event_failure(key.clone(), reason.clone()).await {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(event_key = %key, error = %e, "failed to record event failure");
            0
        },
    };

    if retry_count as u32 >= config.event_max_retries {
        match store.dead_letter_event(key.clone(), reason).await {
            Ok(()) => {
                tracing::error!(event_key = %key, retry_count, "event dead-lettered");
            },
            Err(e) => {
                tracing::error!(event_key = %key, error = %e, "failed to dead-letter event");
            },
        }
        return;
    }

    tracing::warn!(
        event_key = %key,
        retry_count,
        error = %reason,
        "fan-out failed, redelivering"
    );

    // Pause so a persistent outage does not spin the partition.
    tokio::select! {
        () = cancel.cancelled() => return,
        () = tokio::time::sleep(config.redelivery_delay) => {},
    }

    if partition.requeue(envelope).is_err() {
        tracing::warn!(event_key = %key, "partition closed, dropping redelivery");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hookrelay_core::{
        broker::{Broker, InMemoryBroker},
        store::memory::MemoryStore,
        DeliveryStatus, EventKey, EventStatus, Provider, RawEvent, Subscription, SubscriptionId,
        TenantId,
    };
    use serde_json::json;
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{client::DeliveryClient, executor::DeliveryExecutor, retry::RetryPolicy};

    fn subscription(target_url: String) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::new(),
            tenant_id: TenantId::from("t1"),
            provider: Provider::Stripe,
            event_type: "invoice.paid".to_string(),
            target_url,
            secret: "sub_secret".to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn resolver(store: Arc<MemoryStore>) -> Arc<FanoutResolver> {
        let executor = DeliveryExecutor::new(
            Arc::clone(&store) as _,
            DeliveryClient::with_defaults().unwrap(),
            RetryPolicy::default(),
        );
        Arc::new(FanoutResolver::new(store, Arc::new(executor)))
    }

    async fn publish(store: &MemoryStore, broker: &InMemoryBroker, event_id: &str) -> EventKey {
        let key = EventKey::new("t1", Provider::Stripe, event_id);
        let raw = RawEvent::new(key.clone(), Some("invoice.paid".into()), json!({"n": 1}));
        let envelope = hookrelay_core::EventEnvelope::from_raw(&raw);
        store.ingest_event(raw).await.unwrap();
        broker.publish(envelope).await.unwrap();
        key
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn consumes_published_events_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let store = Arc::new(MemoryStore::new());
        store.add_subscription(subscription(server.uri())).await;

        let (broker, partitions) = InMemoryBroker::new(2);
        let cancel = CancellationToken::new();
        let pool = ConsumerPool::spawn(
            partitions,
            resolver(Arc::clone(&store)),
            Arc::clone(&store) as _,
            ConsumerConfig::default(),
            cancel.clone(),
        );
        assert_eq!(pool.len(), 2);

        let key = publish(&store, &broker, "evt_1").await;

        let state_store = Arc::clone(&store);
        let state_key = key.clone();
        wait_for(move || {
            let store = Arc::clone(&state_store);
            let key = state_key.clone();
            async move {
                store
                    .find_event_state(key)
                    .await
                    .unwrap()
                    .is_some_and(|s| s.status == EventStatus::Success)
            }
        })
        .await;

        let deliveries = store.deliveries_for_event(&key).await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Success);

        pool.shutdown_graceful(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn transient_store_failure_is_redelivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let store = Arc::new(MemoryStore::new());
        store.add_subscription(subscription(server.uri())).await;
        store.fail_subscription_lookups(1);

        let (broker, partitions) = InMemoryBroker::new(1);
        let cancel = CancellationToken::new();
        let config = ConsumerConfig {
            event_max_retries: 5,
            redelivery_delay: Duration::from_millis(10),
        };
        let pool = ConsumerPool::spawn(
            partitions,
            resolver(Arc::clone(&store)),
            Arc::clone(&store) as _,
            config,
            cancel.clone(),
        );

        let key = publish(&store, &broker, "evt_1").await;

        let state_store = Arc::clone(&store);
        let state_key = key.clone();
        wait_for(move || {
            let store = Arc::clone(&state_store);
            let key = state_key.clone();
            async move {
                store
                    .find_event_state(key)
                    .await
                    .unwrap()
                    .is_some_and(|s| s.status == EventStatus::Success)
            }
        })
        .await;

        // Exactly one successful delivery despite the redelivery.
        let deliveries = store.deliveries_for_event(&key).await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Success);

        pool.shutdown_graceful(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn exhausted_event_budget_dead_letters_the_event() {
        let store = Arc::new(MemoryStore::new());
        store.fail_subscription_lookups(100);

        let (broker, partitions) = InMemoryBroker::new(1);
        let cancel = CancellationToken::new();
        let config = ConsumerConfig {
            event_max_retries: 2,
            redelivery_delay: Duration::from_millis(5),
        };
        let pool = ConsumerPool::spawn(
            partitions,
            resolver(Arc::clone(&store)),
            Arc::clone(&store) as _,
            config,
            cancel.clone(),
        );

        // The event type must match something for the lookup to run.
        let key = publish(&store, &broker, "evt_1").await;

        let state_store = Arc::clone(&store);
        let state_key = key.clone();
        wait_for(move || {
            let store = Arc::clone(&state_store);
            let key = state_key.clone();
            async move {
                store
                    .find_event_state(key)
                    .await
                    .unwrap()
                    .is_some_and(|s| s.status == EventStatus::DeadLetter)
            }
        })
        .await;

        let entries = store.dead_letters(TenantId::from("t1"), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].failure_reason.contains("subscription lookup"));

        pool.shutdown_graceful(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_stops_idle_consumers() {
        let store = Arc::new(MemoryStore::new());
        let (_broker, partitions) = InMemoryBroker::new(3);
        let cancel = CancellationToken::new();
        let pool = ConsumerPool::spawn(
            partitions,
            resolver(Arc::clone(&store)),
            Arc::clone(&store) as _,
            ConsumerConfig::default(),
            cancel.clone(),
        );

        cancel.cancel();
        pool.shutdown_graceful(Duration::from_secs(1)).await;
    }
}
