//! Domain models and strongly-typed identifiers.
//!
//! Defines raw events, event processing state, subscriptions, deliveries,
//! and the broker envelope, plus newtype wrappers for compile-time type
//! safety. Status enums carry database codecs storing lowercase text.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed tenant identifier.
///
/// Opaque string assigned by the management plane. Every event, delivery,
/// and subscription is scoped to exactly one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    /// Returns the tenant identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl sqlx::Type<PgDb> for TenantId {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TenantId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(s))
    }
}

impl sqlx::Encode<'_, PgDb> for TenantId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Upstream webhook provider.
///
/// Closed set: adding a provider means adding a variant and a verifier.
/// Unknown provider strings fail parsing instead of falling back to a
/// pass-through behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Stripe webhooks (`Stripe-Signature` scheme).
    Stripe,
    /// GitHub webhooks (`X-Hub-Signature-256` scheme).
    Github,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stripe => write!(f, "stripe"),
            Self::Github => write!(f, "github"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "github" => Ok(Self::Github),
            _ => Err(crate::CoreError::InvalidInput(format!("unknown provider: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for Provider {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Provider {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "stripe" => Ok(Self::Stripe),
            "github" => Ok(Self::Github),
            _ => Err(format!("invalid provider: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for Provider {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Strongly-typed subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Creates a new random subscription ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for SubscriptionId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SubscriptionId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for SubscriptionId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed delivery identifier.
///
/// One delivery row per (event, subscription) pair; this ID follows the
/// delivery through claim, retry, and terminal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Natural key of an event: `(tenant, provider, provider event id)`.
///
/// Deduplication, ordering, and state lookups all run on this key. The
/// provider event ID is the upstream identifier, not our row UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// Tenant owning the event.
    pub tenant_id: TenantId,
    /// Provider the event originated from.
    pub provider: Provider,
    /// Provider-assigned event identifier.
    pub event_id: String,
}

impl EventKey {
    /// Creates an event key.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        provider: Provider,
        event_id: impl Into<String>,
    ) -> Self {
        Self { tenant_id: tenant_id.into(), provider, event_id: event_id.into() }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tenant_id, self.provider, self.event_id)
    }
}

/// Event processing lifecycle status.
///
/// ```text
/// received -> processing -> success
///                        -> failed -> processing (redelivery)
///                        -> failed -> dead_letter
/// ```
///
/// `success` and `dead_letter` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Persisted and published, not yet picked up by a consumer.
    Received,

    /// A consumer claimed the event and is fanning out deliveries.
    Processing,

    /// Fan-out completed. Terminal.
    Success,

    /// Fan-out hit a transient error; awaiting redelivery.
    Failed,

    /// Redelivery budget exhausted. Terminal.
    DeadLetter,
}

impl EventStatus {
    /// Returns true for states that admit no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::DeadLetter)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Processing => write!(f, "processing"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "received" => Ok(Self::Received),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(format!("invalid event status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for EventStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Delivery attempt lifecycle status.
///
/// ```text
/// pending -> processing -> success
///                       -> failed -> processing (retry)
///                       -> failed -> dead_letter
/// ```
///
/// Claiming a delivery is a conditional transition into `processing`;
/// losing the claim race leaves the row untouched for the winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created during fan-out, no attempt made yet.
    Pending,

    /// An executor holds the claim and is attempting the POST.
    Processing,

    /// Destination acknowledged with 2xx. Terminal.
    Success,

    /// Attempt failed; scheduled for retry at `next_retry_at`.
    Failed,

    /// Retry budget exhausted. Terminal.
    DeadLetter,
}

impl DeliveryStatus {
    /// Returns true for states that admit no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::DeadLetter)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(format!("invalid delivery status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Immutable record of an ingested webhook.
///
/// Written exactly once per event key; never updated afterwards. The
/// payload stored here is the snapshot delivered downstream and copied
/// into the dead letter queue on terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawEvent {
    /// Row identifier.
    pub id: Uuid,

    /// Tenant owning the event.
    pub tenant_id: TenantId,

    /// Provider the event originated from.
    pub provider: Provider,

    /// Provider-assigned event identifier.
    pub event_id: String,

    /// Provider event type (e.g. `invoice.paid`, `push`), when known.
    pub event_type: Option<String>,

    /// Verified JSON payload as received.
    pub payload: serde_json::Value,

    /// Payload schema version, currently always `v1`.
    pub schema_version: String,

    /// When the webhook was received.
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    /// Creates a raw event for the given key with the current timestamp.
    pub fn new(key: EventKey, event_type: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: key.tenant_id,
            provider: key.provider,
            event_id: key.event_id,
            event_type,
            payload,
            schema_version: "v1".to_string(),
            received_at: Utc::now(),
        }
    }

    /// Natural key of this event.
    pub fn key(&self) -> EventKey {
        EventKey::new(self.tenant_id.clone(), self.provider, self.event_id.clone())
    }
}

/// Mutable processing state of an event.
///
/// Separate from the raw record so the immutable payload row never sees
/// an UPDATE. The unique key on `(tenant_id, provider, event_id)` is the
/// idempotency guard for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventState {
    /// Row identifier.
    pub id: Uuid,

    /// Tenant owning the event.
    pub tenant_id: TenantId,

    /// Provider the event originated from.
    pub provider: Provider,

    /// Provider-assigned event identifier.
    pub event_id: String,

    /// Current lifecycle status.
    pub status: EventStatus,

    /// Number of failed fan-out attempts.
    pub retry_count: i32,

    /// Reason recorded with the most recent failure.
    pub error_reason: Option<String>,

    /// When the state row was created.
    pub created_at: DateTime<Utc>,

    /// When the state row was last updated.
    pub updated_at: DateTime<Utc>,
}

impl EventState {
    /// Creates a state row in `received` for the given key.
    pub fn received(key: EventKey) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: key.tenant_id,
            provider: key.provider,
            event_id: key.event_id,
            status: EventStatus::Received,
            retry_count: 0,
            error_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Natural key of this event.
    pub fn key(&self) -> EventKey {
        EventKey::new(self.tenant_id.clone(), self.provider, self.event_id.clone())
    }
}

/// Destination registration for a (tenant, provider, event type) triple.
///
/// Rows are owned by the external management plane; the engine only
/// reads them during fan-out. Inactive subscriptions are skipped.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    /// Unique identifier for this subscription.
    pub id: SubscriptionId,

    /// Tenant owning the subscription.
    pub tenant_id: TenantId,

    /// Provider whose events this subscription receives.
    pub provider: Provider,

    /// Provider event type this subscription matches.
    pub event_type: String,

    /// Destination URL for signed POSTs.
    pub target_url: String,

    /// Per-subscription signing secret.
    pub secret: String,

    /// Whether this subscription currently receives deliveries.
    pub is_active: bool,

    /// When this subscription was created.
    pub created_at: DateTime<Utc>,

    /// When this subscription was last updated.
    pub updated_at: DateTime<Utc>,
}

/// One delivery obligation: an event bound to a subscription.
///
/// Unique on `(event_id, subscription_id)` so fan-out under broker
/// redelivery never creates duplicate obligations.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delivery {
    /// Unique identifier for this delivery.
    pub id: DeliveryId,

    /// Tenant owning the event.
    pub tenant_id: TenantId,

    /// Provider the event originated from.
    pub provider: Provider,

    /// Provider-assigned event identifier.
    pub event_id: String,

    /// Subscription this delivery targets.
    pub subscription_id: SubscriptionId,

    /// Current lifecycle status.
    pub status: DeliveryStatus,

    /// Number of failed attempts so far.
    pub retry_count: i32,

    /// Error recorded with the most recent failed attempt.
    pub last_error: Option<String>,

    /// When the next retry becomes due. Only meaningful in `failed`.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// When this delivery was created.
    pub created_at: DateTime<Utc>,

    /// When this delivery was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Creates a pending delivery for the given event and subscription.
    pub fn pending(key: EventKey, subscription_id: SubscriptionId) -> Self {
        let now = Utc::now();
        Self {
            id: DeliveryId::new(),
            tenant_id: key.tenant_id,
            provider: key.provider,
            event_id: key.event_id,
            subscription_id,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Natural key of the underlying event.
    pub fn key(&self) -> EventKey {
        EventKey::new(self.tenant_id.clone(), self.provider, self.event_id.clone())
    }
}

/// Everything an executor needs to attempt one delivery.
///
/// Delivery row joined with the subscription target and the immutable
/// payload, so the retry path rebuilds the exact envelope the immediate
/// path sends.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryTask {
    /// Delivery being attempted.
    pub delivery_id: DeliveryId,

    /// Subscription this delivery targets.
    pub subscription_id: SubscriptionId,

    /// Tenant owning the event.
    pub tenant_id: TenantId,

    /// Provider the event originated from.
    pub provider: Provider,

    /// Provider-assigned event identifier.
    pub event_id: String,

    /// Provider event type, when known.
    pub event_type: Option<String>,

    /// Verified payload snapshot.
    pub payload: serde_json::Value,

    /// Failed attempts so far, before this one.
    pub retry_count: i32,

    /// Destination URL.
    pub target_url: String,

    /// Signing secret for this destination.
    pub secret: String,
}

impl DeliveryTask {
    /// Natural key of the underlying event.
    pub fn key(&self) -> EventKey {
        EventKey::new(self.tenant_id.clone(), self.provider, self.event_id.clone())
    }
}

/// Terminal failure record, append-only.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetterEntry {
    /// Row identifier.
    pub id: Uuid,

    /// Tenant owning the event.
    pub tenant_id: TenantId,

    /// Provider the event originated from.
    pub provider: Provider,

    /// Provider-assigned event identifier.
    pub event_id: String,

    /// Payload snapshot at the time of terminal failure.
    pub payload: serde_json::Value,

    /// Last failure reason before giving up.
    pub failure_reason: String,

    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
}

/// Message published to the broker after a successful ingest commit.
///
/// Serialized as camelCase JSON on the wire. The partition key keeps all
/// messages for one event key on one partition, preserving their order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Tenant owning the event.
    pub tenant_id: TenantId,

    /// Provider the event originated from.
    pub provider: Provider,

    /// Provider-assigned event identifier.
    pub event_id: String,

    /// Provider event type, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// Verified payload snapshot.
    pub payload: serde_json::Value,

    /// When the envelope was published.
    pub published_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Builds an envelope from an ingested raw event.
    pub fn from_raw(event: &RawEvent) -> Self {
        Self {
            tenant_id: event.tenant_id.clone(),
            provider: event.provider,
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            published_at: Utc::now(),
        }
    }

    /// Natural key of the event.
    pub fn key(&self) -> EventKey {
        EventKey::new(self.tenant_id.clone(), self.provider, self.event_id.clone())
    }

    /// Partition key: `"{tenant}:{provider}:{event}"`.
    pub fn partition_key(&self) -> String {
        self.key().to_string()
    }
}
