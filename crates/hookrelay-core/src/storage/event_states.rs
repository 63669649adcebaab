//! Repository for mutable event processing state.
//!
//! The state row doubles as the ingestion idempotency guard: the insert
//! is `ON CONFLICT DO NOTHING` on the event key, and a zero-row result is
//! the duplicate signal. All status transitions are conditional updates
//! so concurrent consumers cannot clobber each other.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{EventKey, EventState},
};

/// Repository for event state database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a state row unless one exists for the same event key.
    ///
    /// Returns `true` when the row was inserted, `false` when the key was
    /// already present. This single statement is the dedup decision; no
    /// prior existence check is made.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_if_absent_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        state: &EventState,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO events_state (
                id, tenant_id, provider, event_id, status,
                retry_count, error_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, provider, event_id) DO NOTHING
            "#,
        )
        .bind(state.id)
        .bind(&state.tenant_id)
        .bind(state.provider)
        .bind(&state.event_id)
        .bind(state.status)
        .bind(state.retry_count)
        .bind(&state.error_reason)
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fetches the state row for an event key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_key(&self, key: &EventKey) -> Result<Option<EventState>> {
        let state = sqlx::query_as::<_, EventState>(
            r#"
            SELECT id, tenant_id, provider, event_id, status,
                   retry_count, error_reason, created_at, updated_at
            FROM events_state
            WHERE tenant_id = $1 AND provider = $2 AND event_id = $3
            "#,
        )
        .bind(&key.tenant_id)
        .bind(key.provider)
        .bind(&key.event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(state)
    }

    /// Claims the event for fan-out: `received|failed -> processing`.
    ///
    /// Returns `true` when this caller won the claim. Zero rows affected
    /// means another consumer holds the event or it is already terminal.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn claim_processing(&self, key: &EventKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events_state
            SET status = 'processing', updated_at = NOW()
            WHERE tenant_id = $1 AND provider = $2 AND event_id = $3
              AND status IN ('received', 'failed')
            "#,
        )
        .bind(&key.tenant_id)
        .bind(key.provider)
        .bind(&key.event_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Marks fan-out complete: `processing -> success`. Terminal.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_succeeded(&self, key: &EventKey) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events_state
            SET status = 'success', error_reason = NULL, updated_at = NOW()
            WHERE tenant_id = $1 AND provider = $2 AND event_id = $3
              AND status = 'processing'
            "#,
        )
        .bind(&key.tenant_id)
        .bind(key.provider)
        .bind(&key.event_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records a fan-out failure and increments the retry counter.
    ///
    /// Returns the retry count after the increment so the caller can
    /// decide between redelivery and dead-lettering.
    ///
    /// # Errors
    ///
    /// Returns error if update fails or the state row is missing.
    pub async fn record_failure(&self, key: &EventKey, reason: &str) -> Result<i32> {
        let retry_count: i32 = sqlx::query_scalar(
            r#"
            UPDATE events_state
            SET status = 'failed', retry_count = retry_count + 1,
                error_reason = $4, updated_at = NOW()
            WHERE tenant_id = $1 AND provider = $2 AND event_id = $3
            RETURNING retry_count
            "#,
        )
        .bind(&key.tenant_id)
        .bind(key.provider)
        .bind(&key.event_id)
        .bind(reason)
        .fetch_one(&*self.pool)
        .await?;

        Ok(retry_count)
    }

    /// Moves the event to `dead_letter` within a transaction.
    ///
    /// Returns `true` when the row transitioned; `false` when it was
    /// already terminal, in which case the caller skips the DLQ insert.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_dead_letter_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &EventKey,
        reason: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events_state
            SET status = 'dead_letter', error_reason = $4, updated_at = NOW()
            WHERE tenant_id = $1 AND provider = $2 AND event_id = $3
              AND status NOT IN ('success', 'dead_letter')
            "#,
        )
        .bind(&key.tenant_id)
        .bind(key.provider)
        .bind(&key.event_id)
        .bind(reason)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
