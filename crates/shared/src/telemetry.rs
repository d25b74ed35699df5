//! Tracing initialization

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// Honors `RUST_LOG`; falls back to `info` for everything with `debug`
/// for the named service crate.
pub fn init_tracing(service: &str) {
    let default_filter = format!("info,{}=debug", service.replace('-', "_"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
