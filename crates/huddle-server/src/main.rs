//! # huddle-server
//!
//! Signaling relay for huddle sessions.
//!
//! Clients open a WebSocket on `/session/<id>`; every text frame is checked
//! against the signaling protocol and fanned out to the other members of
//! the same session. Nothing is stored. Media never passes through here.

mod api;
mod config;
mod error;
mod rate_limit;
mod room;

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,huddle_server=debug")),
        )
        .init();

    info!("Starting huddle signaling relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env();
    info!(?config, "Loaded configuration");

    let http_addr = config.http_addr;
    let state = AppState::new(config);

    // Evict per-IP buckets idle for more than 10 minutes
    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.purge_stale(600.0).await;
        }
    });

    if let Err(e) = api::serve(state, http_addr).await {
        tracing::error!(error = %e, "Relay server failed");
        return Err(e);
    }

    Ok(())
}
