//! Broker port between ingestion and fan-out.
//!
//! Ingestion publishes an [`EventEnvelope`] after its commit; one consumer
//! per partition drains envelopes and drives fan-out. Partitioning is by
//! event key hash, so all messages for one key stay ordered on one
//! partition. Delivery is at-least-once: a consumer re-enqueues the
//! envelope at its partition tail when the handler asks for a retry.

use std::{
    future::Future,
    hash::{DefaultHasher, Hash, Hasher},
    pin::Pin,
};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::EventEnvelope;

/// Broker publish failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The partition channel has no receiver anymore.
    #[error("broker partition {0} is closed")]
    PartitionClosed(usize),
}

/// Publish side of the broker.
///
/// The engine only ever publishes; consumption happens through the
/// partition handles handed out at construction time. A Kafka-backed
/// implementation slots in behind this same trait.
pub trait Broker: Send + Sync + 'static {
    /// Publishes an envelope to the partition owning its key.
    fn publish(
        &self,
        envelope: EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

/// In-process broker backed by one unbounded channel per partition.
pub struct InMemoryBroker {
    senders: Vec<mpsc::UnboundedSender<EventEnvelope>>,
}

/// Consume side of one broker partition.
///
/// Held by exactly one consumer task. `requeue` puts an envelope back at
/// the partition tail, which is how redelivery works here.
pub struct Partition {
    /// Partition index, used in consumer task names and logs.
    pub index: usize,
    receiver: mpsc::UnboundedReceiver<EventEnvelope>,
    requeue: mpsc::UnboundedSender<EventEnvelope>,
}

impl Partition {
    /// Receives the next envelope, or `None` once the broker is dropped
    /// and the partition is drained.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.receiver.recv().await
    }

    /// Re-enqueues an envelope at the tail of this partition.
    pub fn requeue(&self, envelope: EventEnvelope) -> Result<(), BrokerError> {
        self.requeue.send(envelope).map_err(|_| BrokerError::PartitionClosed(self.index))
    }
}

impl InMemoryBroker {
    /// Creates a broker with `partitions` channels and returns the
    /// publish half plus one [`Partition`] handle per channel.
    pub fn new(partitions: usize) -> (Self, Vec<Partition>) {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut handles = Vec::with_capacity(partitions);
        for index in 0..partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            handles.push(Partition { index, receiver: rx, requeue: tx.clone() });
            senders.push(tx);
        }
        (Self { senders }, handles)
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }
}

impl Broker for InMemoryBroker {
    fn publish(
        &self,
        envelope: EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let index = self.partition_for(&envelope.partition_key());
            tracing::debug!(
                event_key = %envelope.key(),
                partition = index,
                "publishing envelope"
            );
            self.senders[index].send(envelope).map_err(|_| BrokerError::PartitionClosed(index))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::{EventKey, Provider, RawEvent};

    fn envelope(event_id: &str) -> EventEnvelope {
        let key = EventKey::new("t1", Provider::Stripe, event_id);
        EventEnvelope::from_raw(&RawEvent::new(key, Some("invoice.paid".into()), json!({})))
    }

    #[tokio::test]
    async fn same_key_preserves_order() {
        let (broker, mut partitions) = InMemoryBroker::new(4);

        for _ in 0..3 {
            broker.publish(envelope("evt_1")).await.unwrap();
        }

        // All three land on the same partition, in publish order.
        let index = {
            let mut hasher = DefaultHasher::new();
            "t1:stripe:evt_1".hash(&mut hasher);
            (hasher.finish() as usize) % 4
        };
        let partition = &mut partitions[index];
        for _ in 0..3 {
            let received = partition.recv().await.unwrap();
            assert_eq!(received.event_id, "evt_1");
        }
    }

    #[tokio::test]
    async fn requeue_appends_at_tail() {
        let (broker, mut partitions) = InMemoryBroker::new(1);
        broker.publish(envelope("evt_a")).await.unwrap();
        broker.publish(envelope("evt_b")).await.unwrap();

        let partition = &mut partitions[0];
        let first = partition.recv().await.unwrap();
        assert_eq!(first.event_id, "evt_a");
        partition.requeue(first).unwrap();

        assert_eq!(partition.recv().await.unwrap().event_id, "evt_b");
        assert_eq!(partition.recv().await.unwrap().event_id, "evt_a");
    }

    #[tokio::test]
    async fn publish_after_consumers_gone_fails() {
        let (broker, partitions) = InMemoryBroker::new(1);
        drop(partitions);
        let err = broker.publish(envelope("evt_1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::PartitionClosed(0)));
    }
}
