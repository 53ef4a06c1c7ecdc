//! Realtime Listener
//!
//! Joins the configured channels and logs their traffic until interrupted.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use realtime_common::config::ListenerConfig;
use realtime_engine::Listener;

#[derive(Parser, Debug)]
#[command(name = "realtime-listen")]
#[command(about = "Tail realtime channel traffic", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "realtime.toml")]
    config: PathBuf,

    /// Endpoint override, e.g. ws://localhost:4000/socket
    #[arg(short, long, env = "REALTIME_ENDPOINT")]
    endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    info!("Realtime listener v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config: ListenerConfig = if args.config.exists() {
        let content = std::fs::read_to_string(&args.config)?;
        toml::from_str(&content)?
    } else {
        info!("Using default configuration");
        ListenerConfig::default()
    };
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }

    let listener = Listener::new(config)?;

    tokio::select! {
        result = listener.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received shutdown signal");
            listener.shutdown().await;
        }
    }

    Ok(())
}
