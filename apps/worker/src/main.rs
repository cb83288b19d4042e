//! Prismcast Worker - remote transcode daemon.
//!
//! Registers with the coordinator, heartbeats system stats, and executes
//! assigned transcode jobs through a local ffmpeg pipeline. Capabilities
//! are declared from a YAML file and stay stable until reconnect.

mod config;
mod stats;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use prismcast_core::{WorkerClient, WorkerClientConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::CapabilityFile;
use crate::stats::SysinfoStats;

/// Prismcast transcode worker daemon.
#[derive(Parser, Debug)]
#[command(name = "prismcast-worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Coordinator control-plane address (host:port).
    #[arg(short = 'a', long, env = "PRISMCAST_COORDINATOR")]
    coordinator: String,

    /// Stable daemon id; generated and persisted next to the capability
    /// file when omitted.
    #[arg(long, env = "PRISMCAST_DAEMON_ID")]
    daemon_id: Option<String>,

    /// Display name; defaults to the hostname.
    #[arg(short, long, env = "PRISMCAST_WORKER_NAME")]
    name: Option<String>,

    /// Shared auth token presented at Register time.
    #[arg(long, env = "PRISMCAST_AUTH_TOKEN", default_value = "")]
    auth_token: String,

    /// Path to the capability declaration (YAML).
    #[arg(short = 'C', long, value_name = "FILE")]
    capabilities: Option<PathBuf>,

    /// Path to the ffmpeg binary.
    #[arg(long, env = "PRISMCAST_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PRISMCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Prismcast Worker v{}", env!("CARGO_PKG_VERSION"));

    let capability_file =
        CapabilityFile::load(args.capabilities.as_deref()).context("Failed to load capabilities")?;
    let capabilities = capability_file.to_capabilities();

    let daemon_id = match args.daemon_id {
        Some(id) => id,
        None => persistent_daemon_id(args.capabilities.as_deref())
            .context("Failed to establish a stable daemon id")?,
    };
    let name = args.name.unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "prismcast-worker".to_string())
    });

    log::info!(
        "Worker {name} ({daemon_id}): {} video encoders, {} gpus, max {} jobs",
        capabilities.video_encoders.len(),
        capabilities.gpus.len(),
        capabilities.max_concurrent_jobs
    );

    let gpu_sessions = Arc::new(Mutex::new(std::collections::HashMap::new()));
    let stats = SysinfoStats::new(capabilities.clone(), gpu_sessions);

    let client = WorkerClient::new(
        WorkerClientConfig {
            coordinator_addr: args.coordinator,
            daemon_id,
            name,
            auth_token: args.auth_token,
            capabilities,
            ffmpeg_path: args.ffmpeg,
            video_ring_capacity: 1000,
            audio_ring_capacity: 2000,
        },
        stats,
    );

    let cancel = CancellationToken::new();
    let client_handle = tokio::spawn(Arc::clone(&client).run(cancel.clone()));

    shutdown_signal().await;
    log::info!("Shutdown signal received");
    cancel.cancel();
    let _ = client_handle.await;

    log::info!("Shutdown complete");
    Ok(())
}

/// Loads or creates the persisted daemon id. The id must survive
/// restarts so the coordinator can reattribute jobs on reconnect.
fn persistent_daemon_id(capability_path: Option<&std::path::Path>) -> Result<String> {
    let dir = capability_path
        .and_then(|p| p.parent())
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let path = dir.join(".prismcast-daemon-id");

    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(trimmed);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id)
        .with_context(|| format!("Failed to persist daemon id to {}", path.display()))?;
    Ok(id)
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
