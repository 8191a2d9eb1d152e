//! CLI entry point for the Livecast daemon
//!
//! Parses command line arguments, runs startup checks, and hosts the
//! broadcast engine behind the status/control server.

use clap::Parser;
use livecast_engine::{
    run_server, run_startup_checks, BroadcastEngine, Config, MemoryStatusStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Livecast daemon - republishes stored video to live ingest endpoints
#[derive(Parser, Debug)]
#[command(name = "livecastd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "livecastd starting");

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!("startup check failed: {}", e);
        return ExitCode::FAILURE;
    }

    let port = config.server.listen_port;
    let engine = BroadcastEngine::new(config, Arc::new(MemoryStatusStore::new()));

    info!(
        port,
        "status server starting on http://127.0.0.1:{}/status", port
    );
    if let Err(e) = run_server(engine, port).await {
        error!("status server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
