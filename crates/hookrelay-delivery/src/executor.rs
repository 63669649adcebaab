//! Claim-and-execute semantics for a single delivery attempt.
//!
//! Both the fan-out path and the retry scheduler funnel through
//! [`DeliveryExecutor::execute`]: claim the row from its expected
//! pre-state, POST, then settle the outcome. Losing the claim means
//! another worker owns the delivery and this call returns with no side
//! effects, not even the HTTP request.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hookrelay_core::{DeliveryStatus, DeliveryTask, EventStore};

use crate::{
    client::DeliveryClient,
    error::{DeliveryError, Result},
    retry::{RetryDecision, RetryPolicy},
};

/// Settled outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Destination acknowledged; delivery is terminal success.
    Delivered,

    /// Another worker claimed the row first; nothing was done.
    LostClaim,

    /// Attempt failed and a retry was scheduled.
    Retried {
        /// When the next attempt becomes due.
        next_retry_at: DateTime<Utc>,
    },

    /// Attempt failed and the retry budget was exhausted.
    DeadLettered,
}

/// Executes delivery attempts and settles their results in the store.
pub struct DeliveryExecutor {
    store: Arc<dyn EventStore>,
    client: DeliveryClient,
    policy: RetryPolicy,
}

impl DeliveryExecutor {
    /// Creates an executor over the given store, client, and policy.
    pub fn new(store: Arc<dyn EventStore>, client: DeliveryClient, policy: RetryPolicy) -> Self {
        Self { store, client, policy }
    }

    /// The retry policy this executor settles failures with.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claims the delivery from `expected`, attempts it, and records the
    /// result.
    ///
    /// HTTP failures are absorbed into the returned outcome; only store
    /// failures propagate as errors, since an unrecorded attempt must be
    /// handled by the caller's own retry path.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Store` when a state transition fails.
    pub async fn execute(
        &self,
        task: &DeliveryTask,
        expected: DeliveryStatus,
    ) -> Result<ExecuteOutcome> {
        let claimed = self.store.claim_delivery(task.delivery_id, expected).await?;
        if !claimed {
            tracing::debug!(
                delivery_id = %task.delivery_id,
                expected = %expected,
                "lost delivery claim"
            );
            return Ok(ExecuteOutcome::LostClaim);
        }

        match self.client.deliver(task).await {
            Ok(()) => {
                self.store.mark_delivery_succeeded(task.delivery_id).await?;
                tracing::info!(
                    delivery_id = %task.delivery_id,
                    event_key = %task.key(),
                    "delivery succeeded"
                );
                Ok(ExecuteOutcome::Delivered)
            },
            Err(DeliveryError::Store(e)) => Err(DeliveryError::Store(e)),
            Err(attempt_error) => self.settle_failure(task, &attempt_error).await,
        }
    }

    async fn settle_failure(
        &self,
        task: &DeliveryTask,
        attempt_error: &DeliveryError,
    ) -> Result<ExecuteOutcome> {
        let retry_count = task.retry_count.saturating_add(1);
        let reason = attempt_error.to_string();

        match self.policy.decide(retry_count as u32, Utc::now()) {
            RetryDecision::Retry { next_retry_at } => {
                self.store
                    .schedule_delivery_retry(
                        task.delivery_id,
                        retry_count,
                        reason.clone(),
                        next_retry_at,
                    )
                    .await?;
                tracing::warn!(
                    delivery_id = %task.delivery_id,
                    event_key = %task.key(),
                    retry_count,
                    next_retry_at = %next_retry_at,
                    error = %reason,
                    "delivery failed, retry scheduled"
                );
                Ok(ExecuteOutcome::Retried { next_retry_at })
            },
            RetryDecision::DeadLetter { reason: budget } => {
                let terminal_reason = format!("{budget}: {reason}");
                self.store.dead_letter_delivery(task.delivery_id, terminal_reason).await?;
                tracing::error!(
                    delivery_id = %task.delivery_id,
                    event_key = %task.key(),
                    retry_count,
                    error = %reason,
                    "delivery dead-lettered"
                );
                Ok(ExecuteOutcome::DeadLettered)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use hookrelay_core::{
        store::memory::MemoryStore, Delivery, EventKey, Provider, RawEvent, Subscription,
        SubscriptionId, TenantId,
    };
    use serde_json::json;
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::client::ClientConfig;

    async fn seed_task(store: &MemoryStore, target_url: String) -> DeliveryTask {
        let key = EventKey::new("t1", Provider::Stripe, "evt_1");
        store
            .ingest_event(RawEvent::new(
                key.clone(),
                Some("invoice.paid".into()),
                json!({"amount": 42}),
            ))
            .await
            .unwrap();

        let now = Utc::now();
        let subscription = Subscription {
            id: SubscriptionId::new(),
            tenant_id: TenantId::from("t1"),
            provider: Provider::Stripe,
            event_type: "invoice.paid".to_string(),
            target_url,
            secret: "sub_secret".to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        store.add_subscription(subscription.clone()).await;

        store.create_delivery(Delivery::pending(key.clone(), subscription.id)).await.unwrap();
        store.pending_deliveries(key).await.unwrap().remove(0)
    }

    fn executor(store: Arc<MemoryStore>) -> DeliveryExecutor {
        DeliveryExecutor::new(
            store,
            DeliveryClient::new(ClientConfig::default()).unwrap(),
            RetryPolicy::default(),
        )
    }

    #[tokio::test]
    async fn success_marks_delivery_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let store = Arc::new(MemoryStore::new());
        let task = seed_task(&store, server.uri()).await;
        let executor = executor(Arc::clone(&store));

        let outcome = executor.execute(&task, DeliveryStatus::Pending).await.unwrap();
        assert_eq!(outcome, ExecuteOutcome::Delivered);

        let delivery = store.find_delivery(task.delivery_id).await.unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn failure_schedules_backoff_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let store = Arc::new(MemoryStore::new());
        let task = seed_task(&store, server.uri()).await;
        let executor = executor(Arc::clone(&store));

        let before = Utc::now();
        let outcome = executor.execute(&task, DeliveryStatus::Pending).await.unwrap();
        let ExecuteOutcome::Retried { next_retry_at } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };

        // retry_count 0 -> 1, so the delay is min(1s * 2^1, cap) = 2s.
        let delay = next_retry_at - before;
        assert!(delay >= chrono::Duration::seconds(2));
        assert!(delay < chrono::Duration::seconds(3));

        let delivery = store.find_delivery(task.delivery_id).await.unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.retry_count, 1);
        assert_eq!(delivery.last_error.as_deref(), Some("destination returned status 503"));
    }

    #[tokio::test]
    async fn lost_claim_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let store = Arc::new(MemoryStore::new());
        let task = seed_task(&store, server.uri()).await;
        let executor = executor(Arc::clone(&store));

        // Another worker already moved the row out of pending.
        store.claim_delivery(task.delivery_id, DeliveryStatus::Pending).await.unwrap();

        let outcome = executor.execute(&task, DeliveryStatus::Pending).await.unwrap();
        assert_eq!(outcome, ExecuteOutcome::LostClaim);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_with_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

        let store = Arc::new(MemoryStore::new());
        let mut task = seed_task(&store, server.uri()).await;
        let executor = executor(Arc::clone(&store));

        // Four failures already recorded; the fifth exhausts the budget.
        task.retry_count = 4;
        let outcome = executor.execute(&task, DeliveryStatus::Pending).await.unwrap();
        assert_eq!(outcome, ExecuteOutcome::DeadLettered);

        let delivery = store.find_delivery(task.delivery_id).await.unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::DeadLetter);

        let entries = store.dead_letters(TenantId::from("t1"), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, json!({"amount": 42}));
        assert!(entries[0].failure_reason.contains("destination returned status 500"));
    }
}
