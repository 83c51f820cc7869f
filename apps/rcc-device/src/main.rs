//! rcc-device - on-device runtime binary for the Realtime Communication Core.
//!
//! Bootstraps the `rcc-core` library against the real hardware backends
//! (microphone/speaker, camera, assets) and runs until a shutdown signal
//! arrives. There is no HTTP/WS surface here - the device is driven entirely
//! by the broker.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rcc_core::HardwareDeps;
use tokio::signal;

/// rcc-device - assistive wearable on-device runtime.
#[derive(Parser, Debug)]
#[command(name = "rcc-device")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "RCC_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Directory holding warning/prompt WAV assets.
    #[arg(short = 'a', long, env = "RCC_ASSETS_DIR", default_value = "assets")]
    assets_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("rcc-device v{}", env!("CARGO_PKG_VERSION"));

    let config =
        config::load_config(args.config.as_deref()).context("Failed to load configuration")?;

    log::info!(
        "Configuration: device_id={}, broker={}:{}",
        config.device_id,
        config.broker.host,
        config.broker.port
    );

    let hardware = HardwareDeps::standard(args.assets_dir);
    let services =
        rcc_core::bootstrap_services(&config, hardware).context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");
    services.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
