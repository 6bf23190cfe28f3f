// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the controller.

use std::time::Duration;

/// Controller configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the shared native-RPC/HTTP listener
    pub port: u16,
    /// Database URL for the controller store
    pub database_url: String,
    /// Domain used to derive an app's default HTTP route host
    pub default_route_domain: Option<String>,
    /// Database connection pool size
    pub db_pool_size: u32,
    /// Deadline for the synchronous scale RPC
    pub scale_timeout: Duration,
}

/// Default deadline for the synchronous scale RPC.
pub const DEFAULT_SCALE_TIMEOUT: Duration = Duration::from_secs(120);

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = std::env::var("GANTRY_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("GANTRY_DATABASE_URL"))?;

        let default_route_domain = std::env::var("DEFAULT_ROUTE_DOMAIN")
            .ok()
            .filter(|v| !v.is_empty());

        let db_pool_size = std::env::var("GANTRY_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let scale_timeout = std::env::var("GANTRY_SCALE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SCALE_TIMEOUT);

        Ok(Self {
            port,
            database_url,
            default_route_domain,
            db_pool_size,
            scale_timeout,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
}
