//! Repository for delivery rows and claim transitions.
//!
//! The claim is the concurrency primitive of the whole delivery path: a
//! conditional UPDATE from an expected pre-state where zero rows affected
//! means another worker owns the row. Fan-out idempotency rests on the
//! unique key over `(event_id, subscription_id)`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Delivery, DeliveryId, DeliveryStatus, DeliveryTask, EventKey},
};

const TASK_COLUMNS: &str = r#"
    d.id AS delivery_id, d.subscription_id, d.tenant_id, d.provider,
    d.event_id, r.event_type, r.payload, d.retry_count,
    s.target_url, s.secret
"#;

const TASK_JOINS: &str = r#"
    FROM event_deliveries d
    JOIN webhook_subscriptions s ON s.id = d.subscription_id
    JOIN events_raw r
      ON r.tenant_id = d.tenant_id
     AND r.provider = d.provider
     AND r.event_id = d.event_id
"#;

/// Repository for delivery database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a delivery unless one exists for the same
    /// `(event_id, subscription_id)` pair.
    ///
    /// Returns `true` when the row was inserted. Safe to call on every
    /// broker redelivery of the same event.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_if_absent(&self, delivery: &Delivery) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO event_deliveries (
                id, tenant_id, provider, event_id, subscription_id,
                status, retry_count, last_error, next_retry_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (event_id, subscription_id) DO NOTHING
            "#,
        )
        .bind(delivery.id)
        .bind(&delivery.tenant_id)
        .bind(delivery.provider)
        .bind(&delivery.event_id)
        .bind(delivery.subscription_id)
        .bind(delivery.status)
        .bind(delivery.retry_count)
        .bind(&delivery.last_error)
        .bind(delivery.next_retry_at)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns executable tasks for an event's pending deliveries.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn pending_for_event(&self, key: &EventKey) -> Result<Vec<DeliveryTask>> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            {TASK_JOINS}
            WHERE d.tenant_id = $1 AND d.provider = $2 AND d.event_id = $3
              AND d.status = 'pending'
            ORDER BY d.created_at ASC
            "#
        );
        let tasks = sqlx::query_as::<_, DeliveryTask>(&sql)
            .bind(&key.tenant_id)
            .bind(key.provider)
            .bind(&key.event_id)
            .fetch_all(&*self.pool)
            .await?;

        Ok(tasks)
    }

    /// Claims a delivery: `expected -> processing`.
    ///
    /// Returns `true` when this caller won. Zero rows affected means the
    /// row is no longer in `expected` and must not be touched.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn claim(&self, id: DeliveryId, expected: DeliveryStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE event_deliveries
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Marks a delivery delivered: `processing -> success`. Terminal.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_succeeded(&self, id: DeliveryId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_deliveries
            SET status = 'success', last_error = NULL, next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records a failed attempt and schedules the next retry.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn schedule_retry(
        &self,
        id: DeliveryId,
        retry_count: i32,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_deliveries
            SET status = 'failed', retry_count = $2, last_error = $3,
                next_retry_at = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .bind(next_retry_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns due retries: `failed` with `next_retry_at <= now`, oldest
    /// deadline first, bounded by `limit`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryTask>> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            {TASK_JOINS}
            WHERE d.status = 'failed' AND d.next_retry_at <= $1
            ORDER BY d.next_retry_at ASC
            LIMIT $2
            "#
        );
        let tasks = sqlx::query_as::<_, DeliveryTask>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        Ok(tasks)
    }

    /// Fetches a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r#"
            SELECT id, tenant_id, provider, event_id, subscription_id,
                   status, retry_count, last_error, next_retry_at,
                   created_at, updated_at
            FROM event_deliveries
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Moves a delivery to `dead_letter` within a transaction.
    ///
    /// Returns the transitioned row, or `None` when it was already
    /// terminal so the caller skips the DLQ insert. The guard keeps the
    /// dead letter move exactly-once even under racing schedulers.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_dead_letter_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: DeliveryId,
        reason: &str,
    ) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r#"
            UPDATE event_deliveries
            SET status = 'dead_letter', last_error = $2, next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('success', 'dead_letter')
            RETURNING id, tenant_id, provider, event_id, subscription_id,
                      status, retry_count, last_error, next_retry_at,
                      created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(delivery)
    }
}
