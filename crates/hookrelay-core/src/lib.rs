//! Core domain types and persistence for the hookrelay pipeline.
//!
//! Provides strongly-typed identifiers and state enums, the event store
//! port with PostgreSQL and in-memory implementations, and the broker
//! port used to decouple ingestion from fan-out delivery.

pub mod broker;
pub mod error;
pub mod models;
pub mod storage;
pub mod store;

pub use error::{CoreError, Result};
pub use models::{
    DeadLetterEntry, Delivery, DeliveryId, DeliveryStatus, DeliveryTask, EventEnvelope, EventKey,
    EventState, EventStatus, Provider, RawEvent, Subscription, SubscriptionId, TenantId,
};
pub use store::{EventStore, IngestOutcome};
