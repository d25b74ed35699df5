//! Database pool construction and migrations

use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a connection pool for regular queries.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("failed to connect to database")?;

    Ok(pool)
}

/// Create a pool without eagerly connecting.
///
/// Used by tests and tooling that construct services without a live database.
pub fn create_lazy_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_lazy(database_url)
        .context("invalid database URL")?;

    Ok(pool)
}

/// Run pending migrations.
///
/// Use a direct (non-pooled) connection URL for this; transaction-mode
/// poolers do not support the prepared statements the migrator issues.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("failed to run migrations")?;

    tracing::info!("Database migrations applied");
    Ok(())
}
