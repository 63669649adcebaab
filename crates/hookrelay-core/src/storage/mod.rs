//! Database access layer implementing the repository pattern.
//!
//! One repository per table, all sharing a connection pool. The rest of
//! the engine goes through the [`crate::store::EventStore`] port; direct
//! SQL outside this module is forbidden to keep transition logic in one
//! place.

use std::sync::Arc;

use sqlx::PgPool;

pub mod dead_letters;
pub mod deliveries;
pub mod event_states;
pub mod raw_events;
pub mod subscriptions;

use crate::error::Result;

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for immutable raw event records.
    pub raw_events: Arc<raw_events::Repository>,

    /// Repository for mutable event processing state.
    pub event_states: Arc<event_states::Repository>,

    /// Repository for subscription lookups.
    pub subscriptions: Arc<subscriptions::Repository>,

    /// Repository for delivery rows and claims.
    pub deliveries: Arc<deliveries::Repository>,

    /// Repository for the dead letter queue.
    pub dead_letters: Arc<dead_letters::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            raw_events: Arc::new(raw_events::Repository::new(pool.clone())),
            event_states: Arc::new(event_states::Repository::new(pool.clone())),
            subscriptions: Arc::new(subscriptions::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.raw_events.pool()).await?;

        Ok(())
    }
}
