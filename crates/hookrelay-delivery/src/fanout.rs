//! Fan-out of a published event into per-subscription deliveries.
//!
//! The retry decision is data: `resolve` never fails, it returns either
//! `Commit` (drop the broker message) or `Retry` (redeliver it later).
//! Per-delivery HTTP failures are settled by the executor and isolated
//! from each other; only store failures make the whole message retry.

use std::sync::Arc;

use hookrelay_core::{Delivery, DeliveryStatus, EventEnvelope, EventStore};

use crate::executor::DeliveryExecutor;

/// What the consumer should do with the broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// Processing finished (or was owned elsewhere); drop the message.
    Commit,
    /// Transient failure; redeliver the message.
    Retry {
        /// Failure recorded against the event state.
        reason: String,
    },
}

/// Resolves one published event into executed deliveries.
pub struct FanoutResolver {
    store: Arc<dyn EventStore>,
    executor: Arc<DeliveryExecutor>,
}

impl FanoutResolver {
    /// Creates a resolver over the given store and executor.
    pub fn new(store: Arc<dyn EventStore>, executor: Arc<DeliveryExecutor>) -> Self {
        Self { store, executor }
    }

    /// Processes one envelope end to end.
    ///
    /// Claims the event, materializes one pending delivery per active
    /// subscription (idempotently, so redelivery never duplicates),
    /// executes the pending set, and marks the event done. Safe to call
    /// again with the same envelope at any point.
    pub async fn resolve(&self, envelope: &EventEnvelope) -> FanoutOutcome {
        let key = envelope.key();

        let claimed = match self.store.claim_event_processing(key.clone()).await {
            Ok(claimed) => claimed,
            Err(e) => return FanoutOutcome::Retry { reason: format!("event claim: {e}") },
        };
        if !claimed {
            tracing::debug!(event_key = %key, "event already owned or terminal, committing");
            return FanoutOutcome::Commit;
        }

        let subscriptions = match &envelope.event_type {
            Some(event_type) => {
                match self
                    .store
                    .active_subscriptions(
                        envelope.tenant_id.clone(),
                        envelope.provider,
                        event_type.clone(),
                    )
                    .await
                {
                    Ok(subscriptions) => subscriptions,
                    Err(e) => {
                        return FanoutOutcome::Retry {
                            reason: format!("subscription lookup: {e}"),
                        };
                    },
                }
            },
            // Without an event type nothing can match.
            None => Vec::new(),
        };

        for subscription in &subscriptions {
            let delivery = Delivery::pending(key.clone(), subscription.id);
            if let Err(e) = self.store.create_delivery(delivery).await {
                return FanoutOutcome::Retry { reason: format!("delivery create: {e}") };
            }
        }

        let pending = match self.store.pending_deliveries(key.clone()).await {
            Ok(pending) => pending,
            Err(e) => return FanoutOutcome::Retry { reason: format!("pending lookup: {e}") },
        };

        if subscriptions.is_empty() && pending.is_empty() {
            tracing::info!(event_key = %key, "no active subscriptions, dropping event");
        }

        for task in &pending {
            // Outcome (success, scheduled retry, dead letter) is settled
            // per delivery; it never fails the message.
            if let Err(e) = self.executor.execute(task, DeliveryStatus::Pending).await {
                return FanoutOutcome::Retry { reason: format!("delivery execute: {e}") };
            }
        }

        if let Err(e) = self.store.mark_event_succeeded(key.clone()).await {
            return FanoutOutcome::Retry { reason: format!("event settle: {e}") };
        }

        tracing::info!(
            event_key = %key,
            deliveries = pending.len(),
            "fan-out complete"
        );
        FanoutOutcome::Commit
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hookrelay_core::{
        store::memory::MemoryStore, EventKey, EventStatus, Provider, RawEvent, Subscription,
        SubscriptionId, TenantId,
    };
    use serde_json::json;
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{client::DeliveryClient, retry::RetryPolicy};

    fn subscription(target_url: String, event_type: &str) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::new(),
            tenant_id: TenantId::from("t1"),
            provider: Provider::Stripe,
            event_type: event_type.to_string(),
            target_url,
            secret: "sub_secret".to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    async fn ingest(store: &MemoryStore, event_id: &str) -> EventEnvelope {
        let key = EventKey::new("t1", Provider::Stripe, event_id);
        let raw = RawEvent::new(key, Some("invoice.paid".into()), json!({"n": 1}));
        let envelope = EventEnvelope::from_raw(&raw);
        store.ingest_event(raw).await.unwrap();
        envelope
    }

    fn resolver(store: Arc<MemoryStore>) -> FanoutResolver {
        let executor = DeliveryExecutor::new(
            Arc::clone(&store) as _,
            DeliveryClient::with_defaults().unwrap(),
            RetryPolicy::default(),
        );
        FanoutResolver::new(store, Arc::new(executor))
    }

    #[tokio::test]
    async fn fans_out_to_all_matching_subscriptions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store.add_subscription(subscription(server.uri(), "invoice.paid")).await;
        store.add_subscription(subscription(server.uri(), "invoice.paid")).await;
        store.add_subscription(subscription(server.uri(), "invoice.voided")).await;

        let envelope = ingest(&store, "evt_1").await;
        let outcome = resolver(Arc::clone(&store)).resolve(&envelope).await;
        assert_eq!(outcome, FanoutOutcome::Commit);

        let key = envelope.key();
        assert_eq!(store.deliveries_for_event(&key).await.len(), 2);
        let state = store.find_event_state(key).await.unwrap().unwrap();
        assert_eq!(state.status, EventStatus::Success);
    }

    #[tokio::test]
    async fn redelivery_creates_no_duplicate_deliveries() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let store = Arc::new(MemoryStore::new());
        store.add_subscription(subscription(server.uri(), "invoice.paid")).await;

        let envelope = ingest(&store, "evt_1").await;
        let resolver = resolver(Arc::clone(&store));

        assert_eq!(resolver.resolve(&envelope).await, FanoutOutcome::Commit);
        // Broker redelivers the same envelope after the first commit.
        assert_eq!(resolver.resolve(&envelope).await, FanoutOutcome::Commit);

        let deliveries = store.deliveries_for_event(&envelope.key()).await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_subscriptions_commits_without_deliveries() {
        let store = Arc::new(MemoryStore::new());
        let envelope = ingest(&store, "evt_1").await;

        let outcome = resolver(Arc::clone(&store)).resolve(&envelope).await;
        assert_eq!(outcome, FanoutOutcome::Commit);

        let key = envelope.key();
        assert!(store.deliveries_for_event(&key).await.is_empty());
        let state = store.find_event_state(key).await.unwrap().unwrap();
        assert_eq!(state.status, EventStatus::Success);
    }

    #[tokio::test]
    async fn store_failure_requests_retry() {
        let store = Arc::new(MemoryStore::new());
        let envelope = ingest(&store, "evt_1").await;
        store.fail_subscription_lookups(1);

        let outcome = resolver(Arc::clone(&store)).resolve(&envelope).await;
        assert!(matches!(outcome, FanoutOutcome::Retry { .. }));
    }

    #[tokio::test]
    async fn one_failing_destination_does_not_block_the_rest() {
        let ok_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&ok_server)
            .await;
        let bad_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&bad_server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store.add_subscription(subscription(ok_server.uri(), "invoice.paid")).await;
        store.add_subscription(subscription(bad_server.uri(), "invoice.paid")).await;

        let envelope = ingest(&store, "evt_1").await;
        let outcome = resolver(Arc::clone(&store)).resolve(&envelope).await;
        assert_eq!(outcome, FanoutOutcome::Commit);

        let deliveries = store.deliveries_for_event(&envelope.key()).await;
        let mut statuses: Vec<_> = deliveries.iter().map(|d| d.status).collect();
        statuses.sort_by_key(|s| s.to_string());
        assert_eq!(statuses, vec![DeliveryStatus::Failed, DeliveryStatus::Success]);
    }
}
