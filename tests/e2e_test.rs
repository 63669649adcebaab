//! End-to-end pipeline tests.
//!
//! Exercises the whole engine in process: signed ingestion through the
//! coordinator, broker fan-out through the consumer pool, scheduled
//! retries, and dead-lettering, against wiremock destinations.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use hookrelay_core::{
    broker::InMemoryBroker,
    store::memory::MemoryStore,
    DeliveryStatus, EventKey, EventStatus, EventStore, IngestOutcome, Provider, Subscription,
    SubscriptionId, TenantId,
};
use hookrelay_delivery::{
    client::{DeliveryClient, SIGNATURE_HEADER},
    consumer::{ConsumerConfig, ConsumerPool},
    executor::DeliveryExecutor,
    fanout::FanoutResolver,
    retry::RetryPolicy,
    scheduler::{RetryScheduler, SchedulerConfig},
};
use hookrelay_ingest::{crypto::generate_hmac_hex, IngestCoordinator};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

const TENANT: &str = "acme";
const SUB_SECRET: &str = "sub_secret";
const STRIPE_SECRET: &str = "whsec_e2e";

/// Whole pipeline wired over the in-memory store and broker, with fast
/// retry timings so tests settle quickly.
struct TestEngine {
    store: Arc<MemoryStore>,
    coordinator: IngestCoordinator,
    consumers: ConsumerPool,
    cancel: CancellationToken,
    scheduler: JoinHandle<()>,
}

impl TestEngine {
    fn start(policy: RetryPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let (broker, partitions) = InMemoryBroker::new(2);

        let client = DeliveryClient::with_defaults().unwrap();
        let executor = Arc::new(DeliveryExecutor::new(Arc::clone(&store) as _, client, policy));
        let resolver =
            Arc::new(FanoutResolver::new(Arc::clone(&store) as _, Arc::clone(&executor)));

        let cancel = CancellationToken::new();
        let consumers = ConsumerPool::spawn(
            partitions,
            resolver,
            Arc::clone(&store) as _,
            ConsumerConfig { event_max_retries: 5, redelivery_delay: Duration::from_millis(10) },
            cancel.clone(),
        );

        let scheduler = RetryScheduler::new(
            Arc::clone(&store) as _,
            executor,
            SchedulerConfig { poll_interval: Duration::from_millis(25), batch_size: 10 },
            cancel.clone(),
        );
        let scheduler = tokio::spawn(scheduler.run());

        let coordinator = IngestCoordinator::new(Arc::clone(&store) as _, Arc::new(broker));

        Self { store, coordinator, consumers, cancel, scheduler }
    }

    async fn subscribe(&self, target_url: String, event_type: &str) -> Subscription {
        let now = Utc::now();
        let subscription = Subscription {
            id: SubscriptionId::new(),
            tenant_id: TenantId::from(TENANT),
            provider: Provider::Stripe,
            event_type: event_type.to_string(),
            target_url,
            secret: SUB_SECRET.to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.store.add_subscription(subscription.clone()).await;
        subscription
    }

    async fn ingest_stripe(&self, body: &[u8]) -> IngestOutcome {
        let headers = stripe_headers(body, STRIPE_SECRET);
        let receipt = self
            .coordinator
            .ingest(TenantId::from(TENANT), "stripe", body, &headers, STRIPE_SECRET)
            .await
            .unwrap();
        receipt.outcome
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.consumers.shutdown_graceful(Duration::from_secs(1)).await;
        let _ = self.scheduler.await;
    }
}

fn stripe_headers(body: &[u8], secret: &str) -> HashMap<String, String> {
    let timestamp = Utc::now().timestamp();
    let signed = format!("{timestamp}.{}", std::str::from_utf8(body).unwrap());
    let mac = generate_hmac_hex(signed.as_bytes(), secret).unwrap();
    HashMap::from([("stripe-signature".to_string(), format!("t={timestamp},v1={mac}"))])
}

fn stripe_body(event_id: &str, event_type: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": event_type,
        "data": { "object": { "amount": 1400 } },
    }))
    .unwrap()
}

fn key(event_id: &str) -> EventKey {
    EventKey::new(TENANT, Provider::Stripe, event_id)
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn wait_for_event_status(store: &Arc<MemoryStore>, key: EventKey, status: EventStatus) {
    let store = Arc::clone(store);
    wait_for(move || {
        let store = Arc::clone(&store);
        let key = key.clone();
        async move {
            store.find_event_state(key).await.unwrap().is_some_and(|s| s.status == status)
        }
    })
    .await;
}

#[tokio::test]
async fn signed_webhook_flows_to_destination() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let engine = TestEngine::start(RetryPolicy::default());
    engine.subscribe(server.uri(), "invoice.paid").await;

    let outcome = engine.ingest_stripe(&stripe_body("evt_1", "invoice.paid")).await;
    assert_eq!(outcome, IngestOutcome::Created);

    wait_for_event_status(&engine.store, key("evt_1"), EventStatus::Success).await;

    let deliveries = engine.store.deliveries_for_event(&key("evt_1")).await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Success);

    // The destination saw exactly one request, signed over its exact body.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let expected = format!("sha256={}", generate_hmac_hex(&requests[0].body, SUB_SECRET).unwrap());
    let signature = requests[0].headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert_eq!(signature, expected);

    let envelope: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(envelope["id"], "evt_1");
    assert_eq!(envelope["type"], "invoice.paid");
    assert_eq!(envelope["provider"], "stripe");
    assert_eq!(envelope["data"]["data"]["object"]["amount"], 1400);

    engine.shutdown().await;
}

#[tokio::test]
async fn duplicate_webhook_is_delivered_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let engine = TestEngine::start(RetryPolicy::default());
    engine.subscribe(server.uri(), "invoice.paid").await;

    let body = stripe_body("evt_1", "invoice.paid");
    assert_eq!(engine.ingest_stripe(&body).await, IngestOutcome::Created);
    assert_eq!(engine.ingest_stripe(&body).await, IngestOutcome::Duplicate);
    assert_eq!(engine.ingest_stripe(&body).await, IngestOutcome::Duplicate);

    wait_for_event_status(&engine.store, key("evt_1"), EventStatus::Success).await;

    // Settle any stray work before counting requests.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn event_fans_out_to_matching_subscriptions_only() {
    let matching = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&matching).await;
    let other = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&other).await;

    let engine = TestEngine::start(RetryPolicy::default());
    engine.subscribe(matching.uri(), "invoice.paid").await;
    engine.subscribe(matching.uri(), "invoice.paid").await;
    engine.subscribe(other.uri(), "invoice.voided").await;

    engine.ingest_stripe(&stripe_body("evt_1", "invoice.paid")).await;
    wait_for_event_status(&engine.store, key("evt_1"), EventStatus::Success).await;

    let deliveries = engine.store.deliveries_for_event(&key("evt_1")).await;
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.status == DeliveryStatus::Success));

    assert_eq!(matching.received_requests().await.unwrap().len(), 2);
    assert!(other.received_requests().await.unwrap().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn failed_delivery_is_retried_until_success() {
    let server = MockServer::start().await;
    // First attempt fails, every later attempt succeeds.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let policy = RetryPolicy {
        max_retries: 5,
        base_delay: Duration::from_millis(20),
        cap_delay: Duration::from_millis(100),
    };
    let engine = TestEngine::start(policy);
    engine.subscribe(server.uri(), "invoice.paid").await;

    engine.ingest_stripe(&stripe_body("evt_1", "invoice.paid")).await;

    let store = Arc::clone(&engine.store);
    wait_for(move || {
        let store = Arc::clone(&store);
        async move {
            let deliveries = store.deliveries_for_event(&key("evt_1")).await;
            deliveries.first().is_some_and(|d| d.status == DeliveryStatus::Success)
        }
    })
    .await;

    let deliveries = engine.store.deliveries_for_event(&key("evt_1")).await;
    assert_eq!(deliveries[0].retry_count, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn exhausted_delivery_lands_in_dead_letter_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

    let policy = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        cap_delay: Duration::from_millis(50),
    };
    let engine = TestEngine::start(policy);
    engine.subscribe(server.uri(), "invoice.paid").await;

    engine.ingest_stripe(&stripe_body("evt_1", "invoice.paid")).await;

    let store = Arc::clone(&engine.store);
    wait_for(move || {
        let store = Arc::clone(&store);
        async move {
            let deliveries = store.deliveries_for_event(&key("evt_1")).await;
            deliveries.first().is_some_and(|d| d.status == DeliveryStatus::DeadLetter)
        }
    })
    .await;

    // The event itself settled: the dead letter is per delivery.
    wait_for_event_status(&engine.store, key("evt_1"), EventStatus::Success).await;

    let entries = engine.store.dead_letters(TenantId::from(TENANT), 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event_id, "evt_1");
    assert!(entries[0].failure_reason.contains("retry budget exhausted"));
    assert_eq!(entries[0].payload["id"], "evt_1");

    // Initial attempt plus one scheduled retry before exhaustion.
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    engine.shutdown().await;
}
