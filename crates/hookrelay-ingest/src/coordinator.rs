//! Idempotent ingestion: persist first, publish after commit.

use std::{collections::HashMap, sync::Arc};

use hookrelay_core::{
    broker::{Broker, BrokerError},
    EventEnvelope, EventKey, EventStore, IngestOutcome, Provider, RawEvent, TenantId,
};
use thiserror::Error;

use crate::verifier::{VerifiedEvent, Verifier, VerifyError};

/// Ingestion failures.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Signature verification rejected the request.
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// Persisting the event failed; nothing was committed.
    #[error("store error: {0}")]
    Store(#[from] hookrelay_core::CoreError),

    /// The event committed durably but the broker publish failed.
    ///
    /// The event key is carried so operators can reconcile: the event
    /// exists in `received` and will not be picked up until republished.
    #[error("event {key} committed but publish failed: {source}")]
    PublishFailed {
        /// Key of the committed event.
        key: EventKey,
        /// Underlying broker failure.
        source: BrokerError,
    },
}

/// Result of a successful ingest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    /// Natural key the event was stored under.
    pub key: EventKey,
    /// Whether the event was new or an idempotent replay.
    pub outcome: IngestOutcome,
}

/// Entry point of the pipeline: verify, persist, publish.
///
/// Persistence and the duplicate decision are one atomic store call;
/// publishing happens strictly after the commit so a broker outage can
/// never lose an accepted event, only delay it.
pub struct IngestCoordinator {
    store: Arc<dyn EventStore>,
    broker: Arc<dyn Broker>,
}

impl IngestCoordinator {
    /// Creates a coordinator over the given store and broker.
    pub fn new(store: Arc<dyn EventStore>, broker: Arc<dyn Broker>) -> Self {
        Self { store, broker }
    }

    /// Verifies a raw webhook and ingests it.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Verify`] before any write when the
    /// signature or provider name is rejected.
    pub async fn ingest(
        &self,
        tenant_id: TenantId,
        provider_tag: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
        secret: &str,
    ) -> Result<IngestReceipt, IngestError> {
        let verifier = Verifier::from_tag(provider_tag)?;
        let event = verifier.verify(body, headers, secret)?;
        self.ingest_verified(tenant_id, verifier.provider(), event).await
    }

    /// Ingests an already-verified event.
    ///
    /// Duplicates return a receipt without publishing. Every `Created`
    /// outcome publishes exactly one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::PublishFailed`] when the event committed
    /// but the broker rejected the envelope.
    pub async fn ingest_verified(
        &self,
        tenant_id: TenantId,
        provider: Provider,
        event: VerifiedEvent,
    ) -> Result<IngestReceipt, IngestError> {
        let key = EventKey::new(tenant_id, provider, event.event_id);
        let raw = RawEvent::new(key.clone(), event.event_type, event.payload);
        let envelope = EventEnvelope::from_raw(&raw);

        let outcome = self.store.ingest_event(raw).await?;
        match outcome {
            IngestOutcome::Duplicate => {
                tracing::debug!(event_key = %key, "duplicate event ignored");
            },
            IngestOutcome::Created => {
                self.broker
                    .publish(envelope)
                    .await
                    .map_err(|source| IngestError::PublishFailed { key: key.clone(), source })?;
                tracing::info!(event_key = %key, "event ingested and published");
            },
        }

        Ok(IngestReceipt { key, outcome })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hookrelay_core::{broker::InMemoryBroker, store::memory::MemoryStore, EventStatus};
    use serde_json::json;

    use super::*;

    fn verified(event_id: &str) -> VerifiedEvent {
        VerifiedEvent {
            event_id: event_id.to_string(),
            event_type: Some("invoice.paid".to_string()),
            payload: json!({"id": event_id}),
        }
    }

    #[tokio::test]
    async fn created_event_is_published_once() {
        let store = Arc::new(MemoryStore::new());
        let (broker, mut partitions) = InMemoryBroker::new(1);
        let coordinator = IngestCoordinator::new(store, Arc::new(broker));

        let receipt = coordinator
            .ingest_verified(TenantId::from("t1"), Provider::Stripe, verified("evt_1"))
            .await
            .unwrap();
        assert_eq!(receipt.outcome, IngestOutcome::Created);

        let envelope = partitions[0].recv().await.unwrap();
        assert_eq!(envelope.event_id, "evt_1");
    }

    #[tokio::test]
    async fn duplicate_event_is_not_republished() {
        let store = Arc::new(MemoryStore::new());
        let (broker, mut partitions) = InMemoryBroker::new(1);
        let coordinator = IngestCoordinator::new(store, Arc::new(broker));

        for _ in 0..3 {
            coordinator
                .ingest_verified(TenantId::from("t1"), Provider::Stripe, verified("evt_1"))
                .await
                .unwrap();
        }

        // Exactly one envelope on the partition.
        assert!(partitions[0].recv().await.is_some());
        let second = tokio::time::timeout(Duration::from_millis(50), partitions[0].recv()).await;
        assert!(second.is_err(), "duplicate ingest published a second envelope");
    }

    #[tokio::test]
    async fn publish_failure_after_commit_is_surfaced() {
        let store = Arc::new(MemoryStore::new());
        let (broker, partitions) = InMemoryBroker::new(1);
        drop(partitions);
        let coordinator = IngestCoordinator::new(Arc::clone(&store) as _, Arc::new(broker));

        let err = coordinator
            .ingest_verified(TenantId::from("t1"), Provider::Stripe, verified("evt_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::PublishFailed { .. }));

        // The event is durable despite the failed publish.
        let key = EventKey::new("t1", Provider::Stripe, "evt_1");
        let state = store.find_event_state(key).await.unwrap().unwrap();
        assert_eq!(state.status, EventStatus::Received);
    }

    #[tokio::test]
    async fn full_ingest_verifies_signatures() {
        let store = Arc::new(MemoryStore::new());
        let (broker, _partitions) = InMemoryBroker::new(1);
        let coordinator = IngestCoordinator::new(store, Arc::new(broker));

        let body = br#"{"id":"evt_1","type":"invoice.paid"}"#;
        let timestamp = chrono::Utc::now().timestamp();
        let signed = format!("{timestamp}.{}", std::str::from_utf8(body).unwrap());
        let mac = crate::crypto::generate_hmac_hex(signed.as_bytes(), "whsec_test").unwrap();
        let headers = HashMap::from([(
            "stripe-signature".to_string(),
            format!("t={timestamp},v1={mac}"),
        )]);

        let receipt = coordinator
            .ingest(TenantId::from("t1"), "stripe", body, &headers, "whsec_test")
            .await
            .unwrap();
        assert_eq!(receipt.outcome, IngestOutcome::Created);

        let bad = coordinator
            .ingest(TenantId::from("t1"), "stripe", body, &headers, "wrong_secret")
            .await;
        assert!(matches!(bad, Err(IngestError::Verify(VerifyError::SignatureMismatch))));

        let unknown = coordinator
            .ingest(TenantId::from("t1"), "shopify", body, &headers, "whsec_test")
            .await;
        assert!(matches!(unknown, Err(IngestError::Verify(VerifyError::UnsupportedProvider(_)))));
    }
}
