//! Shared infrastructure for the Hotelier back office
//!
//! Environment configuration, database pool construction, migrations,
//! and tracing initialization used by the ledger crate and its consumers.

pub mod config;
pub mod db;
pub mod telemetry;

pub use config::Config;
pub use db::{create_lazy_pool, create_pool, run_migrations};
pub use telemetry::init_tracing;
