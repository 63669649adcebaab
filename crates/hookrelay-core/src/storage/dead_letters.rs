//! Repository for the append-only dead letter queue.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{DeadLetterEntry, TenantId},
};

/// Repository for dead letter queue operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends a dead letter entry within the terminating transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &DeadLetterEntry,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events_dlq (
                id, tenant_id, provider, event_id, payload,
                failure_reason, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.tenant_id)
        .bind(entry.provider)
        .bind(&entry.event_id)
        .bind(&entry.payload)
        .bind(&entry.failure_reason)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Returns recent dead letter entries for a tenant, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_tenant(
        &self,
        tenant_id: &TenantId,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>> {
        let entries = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT id, tenant_id, provider, event_id, payload,
                   failure_reason, created_at
            FROM events_dlq
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }
}
