//! # Beacon Gateway
//!
//! Presence and realtime gateway for team chat.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon
//!
//! # Run with custom config
//! beacon  # reads beacon.toml, /etc/beacon/beacon.toml, ~/.config/beacon/beacon.toml
//!
//! # Run with environment variables
//! BEACON_PORT=8006 BEACON_REDIS_URL=redis://redis:6379/0 beacon
//! ```

mod auth;
mod bus;
mod config;
mod fanout;
mod handlers;
mod heartbeat;
mod metrics;
mod rest;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Beacon gateway on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
