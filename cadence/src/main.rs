//! Cadence - CPU frequency and voltage scaling daemon for DaemonOS
//!
//! Provides:
//! - Per-core frequency requests with ordered voltage sequencing
//! - Shared cache-domain vote aggregation
//! - Hot-plug lifecycle handling
//! - Administrative core-voltage overrides

use anyhow::Result;
use cadence::config::CadenceConfig;
use cadence::engine::{Backends, ScalingEngine};
use cadence::hotplug::HotplugCoordinator;
use cadence::ipc::IpcServer;
use cadence::sim::SimulatedSoc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Cadence - CPU frequency and voltage scaling daemon
#[derive(Parser, Debug)]
#[command(name = "cadenced", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/grimoire/system/cadence.yaml")]
    config: PathBuf,

    /// Socket path (overrides the configured one)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Debug mode
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // The log level lives in the config, so it is read before logging starts.
    let config = CadenceConfig::load(&args.config)?;

    let log_level = if args.debug {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    info!("Cadence v{} starting", env!("CARGO_PKG_VERSION"));

    let platform = config.platform()?;
    let soc = Arc::new(SimulatedSoc::new());
    let engine = ScalingEngine::new(platform, Backends::simulated(soc))?;
    config.apply_tuning(&engine)?;

    info!(
        "Scaling {} cores over {:?} kHz",
        engine.num_cores(),
        engine.scaling_frequencies()
    );

    let coordinator = Arc::new(HotplugCoordinator::new(Arc::new(engine)));

    // Start IPC server
    let socket_path = match args.socket {
        Some(path) => path.to_string_lossy().to_string(),
        None => config.daemon.socket_path.clone(),
    };
    let server = IpcServer::new(socket_path, coordinator);

    info!("Cadence ready");
    server.run().await
}
