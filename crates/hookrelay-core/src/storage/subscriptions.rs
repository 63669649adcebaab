//! Repository for subscription lookups.
//!
//! Subscriptions are written by the external management plane; the
//! engine only reads the active set during fan-out.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Provider, Subscription, TenantId},
};

/// Repository for subscription database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns active subscriptions matching the event coordinates.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active(
        &self,
        tenant_id: &TenantId,
        provider: Provider,
        event_type: &str,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, tenant_id, provider, event_type, target_url,
                   secret, is_active, created_at, updated_at
            FROM webhook_subscriptions
            WHERE tenant_id = $1 AND provider = $2 AND event_type = $3
              AND is_active = TRUE
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .bind(provider)
        .bind(event_type)
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }
}
