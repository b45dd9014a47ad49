//! Extension supervisor daemon binary
//!
//! Launches the extensions listed in a TOML file and keeps them running.

#![allow(unused_crate_dependencies)]

use clap::Parser;
use daemon::Daemon;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "extvisord")]
#[command(about = "Supervise telemetry extension processes")]
#[command(version)]
struct Args {
    /// Extension configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    extvisor_core::utils::init_tracing(&args.log_level)?;

    info!("Starting extension supervisor daemon");
    if args.config.is_none() {
        info!("No configuration file given; running without extensions");
    }

    let daemon = Daemon::new(args.config)?;
    if let Err(e) = daemon.run().await {
        error!("Daemon failed: {}", e);
        daemon.shutdown().await;
        return Err(e.into());
    }
    Ok(())
}
