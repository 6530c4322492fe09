//! # Parlor Server
//!
//! Room relay server. Any number of instances can run behind a load
//! balancer; they share messages through the pub/sub backbone.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (Redis on localhost)
//! parlor
//!
//! # Run with custom config
//! parlor --config /path/to/parlor.toml
//!
//! # Run a single instance without Redis
//! PARLOR_BACKBONE_URL=memory:// PARLOR_PORT=8080 parlor
//! ```

mod backbone;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "parlor", version, about = "Horizontally scalable room relay server")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, env = "PARLOR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!(
        backbone = %config.backbone.url,
        rooms = ?config.rooms.names,
        "Starting Parlor server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
