//! Hookrelay webhook delivery engine.
//!
//! Main entry point for the engine process. Initializes the store,
//! broker, consumer pool, retry scheduler, and publish recovery sweep,
//! and coordinates graceful startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookrelay_core::{
    broker::{Broker, InMemoryBroker},
    store::PostgresEventStore,
    EventStore,
};
use hookrelay_delivery::{
    client::DeliveryClient, consumer::ConsumerPool, executor::DeliveryExecutor,
    fanout::FanoutResolver, scheduler::RetryScheduler,
};
use hookrelay_ingest::republisher::Republisher;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting hookrelay delivery engine");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        broker_partitions = config.broker_partitions,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    // Wire the pipeline: store -> broker -> consumers, plus the retry
    // scheduler and the publish recovery sweep over the same store.
    let pool = Arc::new(db_pool);
    let store: Arc<dyn EventStore> = Arc::new(PostgresEventStore::new(Arc::clone(&pool)));

    let (broker, partitions) = InMemoryBroker::new(config.broker_partitions);
    let broker: Arc<dyn Broker> = Arc::new(broker);

    let client = DeliveryClient::new(config.to_client_config())
        .context("Failed to build delivery client")?;
    let executor =
        Arc::new(DeliveryExecutor::new(Arc::clone(&store), client, config.to_retry_policy()));
    let resolver = Arc::new(FanoutResolver::new(Arc::clone(&store), Arc::clone(&executor)));

    let cancel = CancellationToken::new();
    let consumers = ConsumerPool::spawn(
        partitions,
        resolver,
        Arc::clone(&store),
        config.to_consumer_config(),
        cancel.clone(),
    );

    let scheduler = RetryScheduler::new(
        Arc::clone(&store),
        executor,
        config.to_scheduler_config(),
        cancel.clone(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run());

    let republisher = Republisher::new(
        Arc::clone(&store),
        Arc::clone(&broker),
        config.to_republisher_config(),
        cancel.clone(),
    );
    let republisher_handle = tokio::spawn(republisher.run());

    info!(consumers = consumers.len(), "Hookrelay is processing events");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    cancel.cancel();
    let grace = Duration::from_secs(config.shutdown_timeout_seconds);
    consumers.shutdown_graceful(grace).await;

    for (name, handle) in [("scheduler", scheduler_handle), ("republisher", republisher_handle)] {
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!(task = name, error = %e, "Background task panicked"),
            Err(_) => warn!(task = name, "Background task did not stop in time"),
        }
    }

    pool.close().await;
    info!("Database connections closed");

    info!("Hookrelay shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookrelay=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                // Verify connection works
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Runs database migrations.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events_raw (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            event_id TEXT NOT NULL,
            event_type TEXT,
            payload JSONB NOT NULL,
            schema_version TEXT NOT NULL,
            received_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE(tenant_id, provider, event_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create events_raw table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events_state (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            event_id TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_reason TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE(tenant_id, provider, event_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create events_state table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhook_subscriptions (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            event_type TEXT NOT NULL,
            target_url TEXT NOT NULL,
            secret TEXT NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create webhook_subscriptions table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_deliveries (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            event_id TEXT NOT NULL,
            subscription_id UUID NOT NULL REFERENCES webhook_subscriptions(id),
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_retry_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE(event_id, subscription_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create event_deliveries table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events_dlq (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            event_id TEXT NOT NULL,
            payload JSONB NOT NULL,
            failure_reason TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create events_dlq table")?;

    // Create indexes
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_event_deliveries_due
        ON event_deliveries(status, next_retry_at)
        WHERE status = 'failed'
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create event_deliveries due index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_events_state_received
        ON events_state(status, updated_at)
        WHERE status = 'received'
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create events_state received index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_subscriptions_match
        ON webhook_subscriptions(tenant_id, provider, event_type)
        WHERE is_active
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create webhook_subscriptions match index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
