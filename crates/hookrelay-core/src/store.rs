//! The event store port and its implementations.
//!
//! Every state transition the engine performs goes through [`EventStore`]:
//! idempotent ingestion, event and delivery claims, retry scheduling, and
//! dead letter moves. [`PostgresEventStore`] delegates to the repository
//! layer; [`memory::MemoryStore`] implements the same observable semantics
//! in process and backs the engine tests.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{
        DeadLetterEntry, Delivery, DeliveryId, DeliveryStatus, DeliveryTask, EventKey, EventState,
        Provider, RawEvent, Subscription, TenantId,
    },
    storage::Storage,
};

/// Boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Result of an ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First time this event key was seen; raw and state rows written.
    Created,
    /// The key already existed; nothing was written.
    Duplicate,
}

/// Port over every state transition in the pipeline.
///
/// Implementations must keep the claim semantics exact: a conditional
/// transition either moves the row from the expected pre-state and
/// reports `true`, or leaves the row untouched and reports `false`.
pub trait EventStore: Send + Sync + 'static {
    /// Persists a new event atomically, deduplicating on the event key.
    ///
    /// Exactly one caller per key ever observes [`IngestOutcome::Created`];
    /// everyone else gets [`IngestOutcome::Duplicate`] with no writes.
    fn ingest_event(&self, event: RawEvent) -> StoreFuture<'_, IngestOutcome>;

    /// Fetches the processing state for an event key.
    fn find_event_state(&self, key: EventKey) -> StoreFuture<'_, Option<EventState>>;

    /// Returns events still in `received` whose state has not moved
    /// since `cutoff`, with their raw payloads. Backs the publish
    /// recovery sweep that re-announces committed-but-unconsumed events.
    fn stale_received_events(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreFuture<'_, Vec<RawEvent>>;

    /// Claims the event for fan-out: `received|failed -> processing`.
    /// `false` means another consumer owns it or it is terminal.
    fn claim_event_processing(&self, key: EventKey) -> StoreFuture<'_, bool>;

    /// Marks fan-out complete: `processing -> success`.
    fn mark_event_succeeded(&self, key: EventKey) -> StoreFuture<'_, ()>;

    /// Records a fan-out failure, increments the event retry counter,
    /// and returns the incremented count.
    fn record_event_failure(&self, key: EventKey, reason: String) -> StoreFuture<'_, i32>;

    /// Moves the event to `dead_letter` and appends a DLQ entry with the
    /// payload snapshot. No-op when the event is already terminal.
    fn dead_letter_event(&self, key: EventKey, reason: String) -> StoreFuture<'_, ()>;

    /// Returns active subscriptions matching the event coordinates.
    fn active_subscriptions(
        &self,
        tenant_id: TenantId,
        provider: Provider,
        event_type: String,
    ) -> StoreFuture<'_, Vec<Subscription>>;

    /// Creates a delivery unless one exists for the same
    /// `(event_id, subscription_id)` pair. Returns `true` on insert.
    fn create_delivery(&self, delivery: Delivery) -> StoreFuture<'_, bool>;

    /// Returns executable tasks for an event's pending deliveries.
    fn pending_deliveries(&self, key: EventKey) -> StoreFuture<'_, Vec<DeliveryTask>>;

    /// Claims a delivery: `expected -> processing`. `false` means the
    /// claim was lost and the row must not be touched.
    fn claim_delivery(&self, id: DeliveryId, expected: DeliveryStatus) -> StoreFuture<'_, bool>;

    /// Marks a delivery delivered: `processing -> success`.
    fn mark_delivery_succeeded(&self, id: DeliveryId) -> StoreFuture<'_, ()>;

    /// Records a failed attempt: status `failed`, updated counter and
    /// error, retry due at `next_retry_at`.
    fn schedule_delivery_retry(
        &self,
        id: DeliveryId,
        retry_count: i32,
        error: String,
        next_retry_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()>;

    /// Returns up to `limit` due retries ordered by their deadline.
    fn due_retries(&self, now: DateTime<Utc>, limit: i64) -> StoreFuture<'_, Vec<DeliveryTask>>;

    /// Moves a delivery to `dead_letter` and appends a DLQ entry with the
    /// payload snapshot. No-op when the delivery is already terminal.
    fn dead_letter_delivery(&self, id: DeliveryId, reason: String) -> StoreFuture<'_, ()>;

    /// Fetches a delivery by ID.
    fn find_delivery(&self, id: DeliveryId) -> StoreFuture<'_, Option<Delivery>>;

    /// Returns recent dead letter entries for a tenant, newest first.
    fn dead_letters(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> StoreFuture<'_, Vec<DeadLetterEntry>>;
}

/// PostgreSQL-backed event store.
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    storage: Storage,
}

impl PostgresEventStore {
    /// Creates a store over the given connection pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { storage: Storage::new(pool.clone()), pool }
    }

    /// Access to the underlying repositories.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl EventStore for PostgresEventStore {
    fn ingest_event(&self, event: RawEvent) -> StoreFuture<'_, IngestOutcome> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let state = EventState::received(event.key());
            let inserted =
                self.storage.event_states.insert_if_absent_in_tx(&mut tx, &state).await?;
            if !inserted {
                tx.rollback().await?;
                return Ok(IngestOutcome::Duplicate);
            }

            self.storage.raw_events.create_in_tx(&mut tx, &event).await?;
            tx.commit().await?;

            Ok(IngestOutcome::Created)
        })
    }

    fn find_event_state(&self, key: EventKey) -> StoreFuture<'_, Option<EventState>> {
        Box::pin(async move { self.storage.event_states.find_by_key(&key).await })
    }

    fn stale_received_events(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreFuture<'_, Vec<RawEvent>> {
        Box::pin(async move { self.storage.raw_events.stale_received(cutoff, limit).await })
    }

    fn claim_event_processing(&self, key: EventKey) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.storage.event_states.claim_processing(&key).await })
    }

    fn mark_event_succeeded(&self, key: EventKey) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.event_states.mark_succeeded(&key).await })
    }

    fn record_event_failure(&self, key: EventKey, reason: String) -> StoreFuture<'_, i32> {
        Box::pin(async move { self.storage.event_states.record_failure(&key, &reason).await })
    }

    fn dead_letter_event(&self, key: EventKey, reason: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let transitioned =
                self.storage.event_states.mark_dead_letter_in_tx(&mut tx, &key, &reason).await?;
            if transitioned {
                let payload = match self.storage.raw_events.find_by_key(&key).await? {
                    Some(raw) => raw.payload,
                    None => serde_json::Value::Null,
                };
                let entry = DeadLetterEntry {
                    id: Uuid::new_v4(),
                    tenant_id: key.tenant_id.clone(),
                    provider: key.provider,
                    event_id: key.event_id.clone(),
                    payload,
                    failure_reason: reason,
                    created_at: Utc::now(),
                };
                self.storage.dead_letters.insert_in_tx(&mut tx, &entry).await?;
            }

            tx.commit().await?;
            Ok(())
        })
    }

    fn active_subscriptions(
        &self,
        tenant_id: TenantId,
        provider: Provider,
        event_type: String,
    ) -> StoreFuture<'_, Vec<Subscription>> {
        Box::pin(async move {
            self.storage.subscriptions.find_active(&tenant_id, provider, &event_type).await
        })
    }

    fn create_delivery(&self, delivery: Delivery) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.storage.deliveries.insert_if_absent(&delivery).await })
    }

    fn pending_deliveries(&self, key: EventKey) -> StoreFuture<'_, Vec<DeliveryTask>> {
        Box::pin(async move { self.storage.deliveries.pending_for_event(&key).await })
    }

    fn claim_delivery(&self, id: DeliveryId, expected: DeliveryStatus) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.storage.deliveries.claim(id, expected).await })
    }

    fn mark_delivery_succeeded(&self, id: DeliveryId) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.deliveries.mark_succeeded(id).await })
    }

    fn schedule_delivery_retry(
        &self,
        id: DeliveryId,
        retry_count: i32,
        error: String,
        next_retry_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.storage.deliveries.schedule_retry(id, retry_count, &error, next_retry_at).await
        })
    }

    fn due_retries(&self, now: DateTime<Utc>, limit: i64) -> StoreFuture<'_, Vec<DeliveryTask>> {
        Box::pin(async move { self.storage.deliveries.due_retries(now, limit).await })
    }

    fn dead_letter_delivery(&self, id: DeliveryId, reason: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let delivery =
                self.storage.deliveries.mark_dead_letter_in_tx(&mut tx, id, &reason).await?;
            if let Some(delivery) = delivery {
                let key = delivery.key();
                let payload = match self.storage.raw_events.find_by_key(&key).await? {
                    Some(raw) => raw.payload,
                    None => serde_json::Value::Null,
                };
                let entry = DeadLetterEntry {
                    id: Uuid::new_v4(),
                    tenant_id: key.tenant_id,
                    provider: key.provider,
                    event_id: key.event_id,
                    payload,
                    failure_reason: reason,
                    created_at: Utc::now(),
                };
                self.storage.dead_letters.insert_in_tx(&mut tx, &entry).await?;
            }

            tx.commit().await?;
            Ok(())
        })
    }

    fn find_delivery(&self, id: DeliveryId) -> StoreFuture<'_, Option<Delivery>> {
        Box::pin(async move { self.storage.deliveries.find_by_id(id).await })
    }

    fn dead_letters(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> StoreFuture<'_, Vec<DeadLetterEntry>> {
        Box::pin(async move { self.storage.dead_letters.find_by_tenant(&tenant_id, limit).await })
    }
}

/// In-memory event store for engine and integration tests.
pub mod memory {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use tokio::sync::RwLock;

    use super::*;
    use crate::{CoreError, EventStatus};

    /// In-memory [`EventStore`] with the same observable semantics as the
    /// PostgreSQL implementation.
    ///
    /// Also exposes failure injection for exercising the consumer's
    /// redelivery path without a database.
    #[derive(Default)]
    pub struct MemoryStore {
        inner: RwLock<Inner>,
        failing_subscription_lookups: AtomicUsize,
    }

    #[derive(Default)]
    struct Inner {
        raw_events: HashMap<EventKey, RawEvent>,
        states: HashMap<EventKey, EventState>,
        subscriptions: Vec<Subscription>,
        deliveries: HashMap<DeliveryId, Delivery>,
        dead_letters: Vec<DeadLetterEntry>,
    }

    impl MemoryStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a subscription, standing in for the management plane.
        pub async fn add_subscription(&self, subscription: Subscription) {
            self.inner.write().await.subscriptions.push(subscription);
        }

        /// Makes the next `n` subscription lookups fail with a database
        /// error, simulating a transient store outage during fan-out.
        pub fn fail_subscription_lookups(&self, n: usize) {
            self.failing_subscription_lookups.store(n, Ordering::SeqCst);
        }

        /// All deliveries recorded for an event key, in no defined order.
        pub async fn deliveries_for_event(&self, key: &EventKey) -> Vec<Delivery> {
            self.inner
                .read()
                .await
                .deliveries
                .values()
                .filter(|d| d.key() == *key)
                .cloned()
                .collect()
        }

        /// The raw event stored for a key, if any.
        pub async fn raw_event(&self, key: &EventKey) -> Option<RawEvent> {
            self.inner.read().await.raw_events.get(key).cloned()
        }

        fn payload_for(inner: &Inner, key: &EventKey) -> serde_json::Value {
            inner
                .raw_events
                .get(key)
                .map(|raw| raw.payload.clone())
                .unwrap_or(serde_json::Value::Null)
        }
    }

    impl EventStore for MemoryStore {
        fn ingest_event(&self, event: RawEvent) -> StoreFuture<'_, IngestOutcome> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                let key = event.key();
                if inner.states.contains_key(&key) {
                    return Ok(IngestOutcome::Duplicate);
                }
                inner.states.insert(key.clone(), EventState::received(key.clone()));
                inner.raw_events.insert(key, event);
                Ok(IngestOutcome::Created)
            })
        }

        fn find_event_state(&self, key: EventKey) -> StoreFuture<'_, Option<EventState>> {
            Box::pin(async move { Ok(self.inner.read().await.states.get(&key).cloned()) })
        }

        fn stale_received_events(
            &self,
            cutoff: DateTime<Utc>,
            limit: i64,
        ) -> StoreFuture<'_, Vec<RawEvent>> {
            Box::pin(async move {
                let inner = self.inner.read().await;
                let mut stale: Vec<&EventState> = inner
                    .states
                    .values()
                    .filter(|s| s.status == EventStatus::Received && s.updated_at <= cutoff)
                    .collect();
                stale.sort_by_key(|s| s.updated_at);
                Ok(stale
                    .into_iter()
                    .take(limit.max(0) as usize)
                    .filter_map(|s| inner.raw_events.get(&s.key()).cloned())
                    .collect())
            })
        }

        fn claim_event_processing(&self, key: EventKey) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                match inner.states.get_mut(&key) {
                    Some(state)
                        if matches!(
                            state.status,
                            EventStatus::Received | EventStatus::Failed
                        ) =>
                    {
                        state.status = EventStatus::Processing;
                        state.updated_at = Utc::now();
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn mark_event_succeeded(&self, key: EventKey) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                if let Some(state) = inner.states.get_mut(&key) {
                    if state.status == EventStatus::Processing {
                        state.status = EventStatus::Success;
                        state.error_reason = None;
                        state.updated_at = Utc::now();
                    }
                }
                Ok(())
            })
        }

        fn record_event_failure(&self, key: EventKey, reason: String) -> StoreFuture<'_, i32> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                let state = inner
                    .states
                    .get_mut(&key)
                    .ok_or_else(|| CoreError::NotFound(format!("event state {key}")))?;
                state.status = EventStatus::Failed;
                state.retry_count += 1;
                state.error_reason = Some(reason);
                state.updated_at = Utc::now();
                Ok(state.retry_count)
            })
        }

        fn dead_letter_event(&self, key: EventKey, reason: String) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                let transitioned = match inner.states.get_mut(&key) {
                    Some(state) if !state.status.is_terminal() => {
                        state.status = EventStatus::DeadLetter;
                        state.error_reason = Some(reason.clone());
                        state.updated_at = Utc::now();
                        true
                    },
                    _ => false,
                };
                if transitioned {
                    let payload = Self::payload_for(&inner, &key);
                    inner.dead_letters.push(DeadLetterEntry {
                        id: Uuid::new_v4(),
                        tenant_id: key.tenant_id.clone(),
                        provider: key.provider,
                        event_id: key.event_id.clone(),
                        payload,
                        failure_reason: reason,
                        created_at: Utc::now(),
                    });
                }
                Ok(())
            })
        }

        fn active_subscriptions(
            &self,
            tenant_id: TenantId,
            provider: Provider,
            event_type: String,
        ) -> StoreFuture<'_, Vec<Subscription>> {
            Box::pin(async move {
                let remaining = self.failing_subscription_lookups.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failing_subscription_lookups.store(remaining - 1, Ordering::SeqCst);
                    return Err(CoreError::Database("injected failure".to_string()));
                }
                Ok(self
                    .inner
                    .read()
                    .await
                    .subscriptions
                    .iter()
                    .filter(|s| {
                        s.is_active
                            && s.tenant_id == tenant_id
                            && s.provider == provider
                            && s.event_type == event_type
                    })
                    .cloned()
                    .collect())
            })
        }

        fn create_delivery(&self, delivery: Delivery) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                let duplicate = inner.deliveries.values().any(|d| {
                    d.event_id == delivery.event_id && d.subscription_id == delivery.subscription_id
                });
                if duplicate {
                    return Ok(false);
                }
                inner.deliveries.insert(delivery.id, delivery);
                Ok(true)
            })
        }

        fn pending_deliveries(&self, key: EventKey) -> StoreFuture<'_, Vec<DeliveryTask>> {
            Box::pin(async move {
                let inner = self.inner.read().await;
                let mut tasks: Vec<DeliveryTask> = inner
                    .deliveries
                    .values()
                    .filter(|d| d.key() == key && d.status == DeliveryStatus::Pending)
                    .filter_map(|d| task_for(&inner, d))
                    .collect();
                tasks.sort_by_key(|t| t.delivery_id.0);
                Ok(tasks)
            })
        }

        fn claim_delivery(
            &self,
            id: DeliveryId,
            expected: DeliveryStatus,
        ) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                match inner.deliveries.get_mut(&id) {
                    Some(delivery) if delivery.status == expected => {
                        delivery.status = DeliveryStatus::Processing;
                        delivery.updated_at = Utc::now();
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn mark_delivery_succeeded(&self, id: DeliveryId) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                if let Some(delivery) = inner.deliveries.get_mut(&id) {
                    if delivery.status == DeliveryStatus::Processing {
                        delivery.status = DeliveryStatus::Success;
                        delivery.last_error = None;
                        delivery.next_retry_at = None;
                        delivery.updated_at = Utc::now();
                    }
                }
                Ok(())
            })
        }

        fn schedule_delivery_retry(
            &self,
            id: DeliveryId,
            retry_count: i32,
            error: String,
            next_retry_at: DateTime<Utc>,
        ) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                if let Some(delivery) = inner.deliveries.get_mut(&id) {
                    delivery.status = DeliveryStatus::Failed;
                    delivery.retry_count = retry_count;
                    delivery.last_error = Some(error);
                    delivery.next_retry_at = Some(next_retry_at);
                    delivery.updated_at = Utc::now();
                }
                Ok(())
            })
        }

        fn due_retries(
            &self,
            now: DateTime<Utc>,
            limit: i64,
        ) -> StoreFuture<'_, Vec<DeliveryTask>> {
            Box::pin(async move {
                let inner = self.inner.read().await;
                let mut due: Vec<&Delivery> = inner
                    .deliveries
                    .values()
                    .filter(|d| {
                        d.status == DeliveryStatus::Failed
                            && d.next_retry_at.is_some_and(|at| at <= now)
                    })
                    .collect();
                due.sort_by_key(|d| d.next_retry_at);
                Ok(due
                    .into_iter()
                    .take(limit.max(0) as usize)
                    .filter_map(|d| task_for(&inner, d))
                    .collect())
            })
        }

        fn dead_letter_delivery(&self, id: DeliveryId, reason: String) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                let key = match inner.deliveries.get_mut(&id) {
                    Some(delivery) if !delivery.status.is_terminal() => {
                        delivery.status = DeliveryStatus::DeadLetter;
                        delivery.last_error = Some(reason.clone());
                        delivery.next_retry_at = None;
                        delivery.updated_at = Utc::now();
                        Some(delivery.key())
                    },
                    _ => None,
                };
                if let Some(key) = key {
                    let payload = Self::payload_for(&inner, &key);
                    inner.dead_letters.push(DeadLetterEntry {
                        id: Uuid::new_v4(),
                        tenant_id: key.tenant_id,
                        provider: key.provider,
                        event_id: key.event_id,
                        payload,
                        failure_reason: reason,
                        created_at: Utc::now(),
                    });
                }
                Ok(())
            })
        }

        fn find_delivery(&self, id: DeliveryId) -> StoreFuture<'_, Option<Delivery>> {
            Box::pin(async move { Ok(self.inner.read().await.deliveries.get(&id).cloned()) })
        }

        fn dead_letters(
            &self,
            tenant_id: TenantId,
            limit: i64,
        ) -> StoreFuture<'_, Vec<DeadLetterEntry>> {
            Box::pin(async move {
                let inner = self.inner.read().await;
                let mut entries: Vec<DeadLetterEntry> = inner
                    .dead_letters
                    .iter()
                    .filter(|e| e.tenant_id == tenant_id)
                    .cloned()
                    .collect();
                entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                entries.truncate(limit.max(0) as usize);
                Ok(entries)
            })
        }
    }

    fn task_for(inner: &Inner, delivery: &Delivery) -> Option<DeliveryTask> {
        let subscription = inner.subscriptions.iter().find(|s| s.id == delivery.subscription_id)?;
        let raw = inner.raw_events.get(&delivery.key())?;
        Some(DeliveryTask {
            delivery_id: delivery.id,
            subscription_id: subscription.id,
            tenant_id: delivery.tenant_id.clone(),
            provider: delivery.provider,
            event_id: delivery.event_id.clone(),
            event_type: raw.event_type.clone(),
            payload: raw.payload.clone(),
            retry_count: delivery.retry_count,
            target_url: subscription.target_url.clone(),
            secret: subscription.secret.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{memory::MemoryStore, *};
    use crate::models::SubscriptionId;

    fn raw(event_id: &str) -> RawEvent {
        let key = EventKey::new("t1", Provider::Stripe, event_id);
        RawEvent::new(key, Some("invoice.paid".into()), json!({"amount": 42}))
    }

    #[tokio::test]
    async fn ingest_is_idempotent_per_key() {
        let store = MemoryStore::new();

        assert_eq!(store.ingest_event(raw("evt_1")).await.unwrap(), IngestOutcome::Created);
        assert_eq!(store.ingest_event(raw("evt_1")).await.unwrap(), IngestOutcome::Duplicate);
        assert_eq!(store.ingest_event(raw("evt_2")).await.unwrap(), IngestOutcome::Created);

        let key = EventKey::new("t1", Provider::Stripe, "evt_1");
        let state = store.find_event_state(key).await.unwrap().unwrap();
        assert_eq!(state.status, crate::EventStatus::Received);
    }

    #[tokio::test]
    async fn same_event_id_different_tenant_is_not_a_duplicate() {
        let store = MemoryStore::new();
        store.ingest_event(raw("evt_1")).await.unwrap();

        let other = RawEvent::new(EventKey::new("t2", Provider::Stripe, "evt_1"), None, json!({}));
        assert_eq!(store.ingest_event(other).await.unwrap(), IngestOutcome::Created);
    }

    #[tokio::test]
    async fn delivery_claim_is_exclusive_under_contention() {
        let store = Arc::new(MemoryStore::new());
        store.ingest_event(raw("evt_1")).await.unwrap();

        let key = EventKey::new("t1", Provider::Stripe, "evt_1");
        let delivery = Delivery::pending(key, SubscriptionId::new());
        let id = delivery.id;
        assert!(store.create_delivery(delivery).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.claim_delivery(id, DeliveryStatus::Pending).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let delivery = store.find_delivery(id).await.unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Processing);
    }

    #[tokio::test]
    async fn dead_letter_delivery_is_exactly_once() {
        let store = MemoryStore::new();
        store.ingest_event(raw("evt_1")).await.unwrap();

        let key = EventKey::new("t1", Provider::Stripe, "evt_1");
        let delivery = Delivery::pending(key.clone(), SubscriptionId::new());
        let id = delivery.id;
        store.create_delivery(delivery).await.unwrap();

        store.dead_letter_delivery(id, "timeout".into()).await.unwrap();
        store.dead_letter_delivery(id, "timeout again".into()).await.unwrap();

        let entries = store.dead_letters(TenantId::from("t1"), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_reason, "timeout");
        assert_eq!(entries[0].payload, json!({"amount": 42}));

        let delivery = store.find_delivery(id).await.unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::DeadLetter);
    }

    #[tokio::test]
    async fn create_delivery_dedupes_on_event_and_subscription() {
        let store = MemoryStore::new();
        store.ingest_event(raw("evt_1")).await.unwrap();

        let key = EventKey::new("t1", Provider::Stripe, "evt_1");
        let subscription_id = SubscriptionId::new();
        assert!(store
            .create_delivery(Delivery::pending(key.clone(), subscription_id))
            .await
            .unwrap());
        assert!(!store
            .create_delivery(Delivery::pending(key.clone(), subscription_id))
            .await
            .unwrap());
        assert_eq!(store.deliveries_for_event(&key).await.len(), 1);
    }
}
