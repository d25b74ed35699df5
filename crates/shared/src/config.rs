//! Environment-based configuration

use anyhow::Context;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection URL (pooler-friendly)
    pub database_url: String,
    /// Direct Postgres URL for migrations (bypasses connection poolers)
    pub database_direct_url: Option<String>,
    /// Maximum connections in the pool
    pub database_max_connections: u32,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Reads a `.env` file first if one is present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_direct_url = std::env::var("DATABASE_DIRECT_URL").ok();
        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            database_url,
            database_direct_url,
            database_max_connections,
        })
    }
}
