//! Courier event delivery service.
//!
//! Main entry point. Loads configuration, prepares the database, starts the
//! delivery engine and the operator API, and shuts both down on a signal.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{AppState, Config};
use courier_core::{RealClock, Storage};
use courier_delivery::DeliveryEngine;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        max_connections = config.database_max_connections,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    Storage::new(db_pool.clone()).migrate().await.context("failed to run database migrations")?;
    info!("database migrations completed");

    let engine_config = config.to_engine_config();
    let mut engine = DeliveryEngine::new(db_pool.clone(), engine_config)
        .context("failed to build delivery engine")?;
    engine.start().context("failed to start delivery engine")?;

    let state = AppState::new(engine.operations(), Arc::new(RealClock::new()));
    let addr = config.parse_server_addr()?;
    let request_timeout = Duration::from_secs(config.request_timeout);
    let shutdown = CancellationToken::new();
    let server_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) =
                courier_api::start_server(state, addr, request_timeout, shutdown.cancelled_owned())
                    .await
            {
                error!(error = %e, "operator API failed");
            }
        }
    });

    info!(addr = %addr, "courier is running");

    courier_api::shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "delivery engine did not stop cleanly");
    }

    let grace = Duration::from_secs(config.shutdown_timeout_secs);
    if tokio::time::timeout(grace, server_handle).await.is_err() {
        warn!("operator API did not stop within the grace period");
    }

    db_pool.close().await;
    info!("courier shutdown complete");
    Ok(())
}

/// Installs the tracing subscriber. `RUST_LOG` wins over the configured
/// filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Connects to PostgreSQL, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}
