// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gantry Controller binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use gantry_controller::config::Config;
use gantry_controller::handlers::HandlerState;
use gantry_controller::store::PostgresStore;
use gantry_controller::{http, mux};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_controller=info".into()),
        )
        .init();

    // Every long-lived stream pins a socket; lift the fd ceiling up front.
    match rlimit::increase_nofile_limit(u64::MAX) {
        Ok(limit) => debug!(limit, "raised file descriptor limit"),
        Err(e) => warn!(error = %e, "failed to raise file descriptor limit"),
    }

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(port = config.port, "Starting gantry controller");

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .connect(&config.database_url)
        .await
        .map_err(|e| {
            error!("Failed to open database: {}", e);
            e
        })?;

    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    debug!(result = row.0, "database health check passed");

    sqlx::raw_sql(include_str!("../migrations/schema.sql"))
        .execute(&pool)
        .await?;
    info!("Database schema verified");

    let store = Arc::new(PostgresStore::new(
        pool.clone(),
        config.default_route_domain.clone(),
    ));
    let state = Arc::new(HandlerState::new(store, config.scale_timeout));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("failed to create listener on {}: {}", addr, e);
        e
    })?;

    let router = http::router(state.clone());
    let server = tokio::spawn(mux::serve(listener, state, router));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    server.abort();
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
