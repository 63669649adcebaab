//! Repository for immutable raw event records.
//!
//! Rows here are written once during ingestion and only ever read
//! afterwards: by the retry path to rebuild the delivery envelope and by
//! the dead letter path to snapshot the payload.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{EventKey, RawEvent},
};

/// Repository for raw event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a raw event within the ingestion transaction.
    ///
    /// Only called after the state-row guard insert reported a new event,
    /// so the unique key on `(tenant_id, provider, event_id)` holds.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &RawEvent,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events_raw (
                id, tenant_id, provider, event_id, event_type,
                payload, schema_version, received_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(&event.tenant_id)
        .bind(event.provider)
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.schema_version)
        .bind(event.received_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Fetches the raw event for a key, if ingested.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_key(&self, key: &EventKey) -> Result<Option<RawEvent>> {
        let event = sqlx::query_as::<_, RawEvent>(
            r#"
            SELECT id, tenant_id, provider, event_id, event_type,
                   payload, schema_version, received_at
            FROM events_raw
            WHERE tenant_id = $1 AND provider = $2 AND event_id = $3
            "#,
        )
        .bind(&key.tenant_id)
        .bind(key.provider)
        .bind(&key.event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Fetches events whose state is still `received` and has not moved
    /// since `cutoff`, oldest first.
    ///
    /// Feeds the publish recovery sweep: events committed before a crash
    /// (or whose broker publish failed) are found here and re-announced.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn stale_received(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<RawEvent>> {
        let events = sqlx::query_as::<_, RawEvent>(
            r#"
            SELECT r.id, r.tenant_id, r.provider, r.event_id, r.event_type,
                   r.payload, r.schema_version, r.received_at
            FROM events_raw r
            JOIN events_state s
              ON s.tenant_id = r.tenant_id
             AND s.provider = r.provider
             AND s.event_id = r.event_id
            WHERE s.status = 'received' AND s.updated_at <= $1
            ORDER BY s.updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }
}
