//! screenlockd - Session screen-lock and idle arbitration daemon.
//!
//! Arbitrates whether the session's screen may be considered locked/blanked
//! by reconciling idle reports, client-held inhibit/throttle leases and
//! session-management signals, and exposes the decision over the bus.

mod bus;
mod config;
mod dispatcher;
mod events;
mod lease;
mod policy;
mod session_bridge;
mod session_manager;

use crate::bus::BusConnectionManager;
use crate::config::Config;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Session screen-lock and idle arbitration daemon.
///
/// Serves the screensaver interface on the session bus and tracks the
/// session-management layer on the system bus.
#[derive(Parser, Debug)]
#[command(name = "screenlockd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("screenlockd v{} starting", env!("CARGO_PKG_VERSION"));

    let config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    let (manager, mut collaborator_events, idle_reports) = BusConnectionManager::new(&config);

    // Collaborators (cover renderer, auth dialog, DPMS sync, idle watcher)
    // subscribe to the broadcast surface and report idleness through the
    // inbound sender; log what they would receive.
    tokio::spawn(async move {
        let _idle_reports = idle_reports;
        while let Ok(event) = collaborator_events.recv().await {
            debug!("Event: {:?}", event);
        }
    });

    manager.run().await
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("screenlockd={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}
