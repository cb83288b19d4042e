//! Prismcast Server - the IPTV relay and transcode coordinator.
//!
//! Serves the HTTP relay/generation API, runs the worker control plane,
//! and supervises the background reapers. Exits 0 on clean shutdown and
//! non-zero on unrecoverable startup failure.

mod catalog;
mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use prismcast_core::pipeline::{GenerationPipeline, NoopIngestionTracker};
use prismcast_core::{
    start_server, AppState, ControlServer, LocalExecutor, ProxyStore, Scheduler, SessionManager,
    WorkerRegistry,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::config::ServerConfig;

/// Prismcast coordinator - IPTV aggregation, relay and transcoding.
#[derive(Parser, Debug)]
#[command(name = "prismcast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PRISMCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// HTTP port (overrides config file).
    #[arg(short = 'p', long, env = "PRISMCAST_HTTP_PORT")]
    http_port: Option<u16>,

    /// Control-plane port (overrides config file).
    #[arg(long, env = "PRISMCAST_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Data directory for artifacts and the logo cache.
    #[arg(short = 'd', long, env = "PRISMCAST_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Prismcast Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    log::info!(
        "Configuration: http={}:{}, control={}:{}, catalog={}, data={}",
        config.bind_addr,
        config.http_port,
        config.bind_addr,
        config.control_port,
        config.catalog.display(),
        config.data_dir.display()
    );

    let core_config = config.to_core_config();
    let catalog = Catalog::open(&config.catalog).context("Failed to open catalog")?;
    let shutdown = CancellationToken::new();

    // Transcode coordination: registry, local executor, scheduler, and the
    // control plane that carries remote jobs.
    let registry = Arc::new(WorkerRegistry::new(
        Duration::from_secs(core_config.coordinator.heartbeat_interval_secs),
        core_config.coordinator.stale_after_missed,
        core_config.coordinator.dead_after_missed,
    ));
    let local = LocalExecutor::new(&core_config.coordinator);
    let scheduler = Scheduler::new(
        registry,
        local,
        Duration::from_secs(core_config.coordinator.retry_cooldown_secs),
    );
    let control = ControlServer::new(Arc::clone(&scheduler), core_config.coordinator.clone());
    scheduler.set_remote(Arc::clone(&control) as Arc<dyn prismcast_core::transcode::RemoteDispatcher>);
    scheduler.spawn_liveness_sweep(
        Duration::from_secs(core_config.coordinator.heartbeat_interval_secs),
        shutdown.clone(),
    );

    // Relay sessions.
    let sessions = SessionManager::new(
        core_config.relay.clone(),
        Arc::clone(&catalog) as Arc<dyn prismcast_core::relay::manager::OriginResolver>,
        Arc::clone(&scheduler) as Arc<dyn prismcast_core::relay::session::TranscodeBackend>,
    );
    sessions.spawn_reaper(shutdown.clone());

    // Generation pipeline with its logo-cache sweeper.
    let pipeline = GenerationPipeline::new(
        core_config.pipeline.clone(),
        Arc::clone(&catalog) as Arc<dyn prismcast_core::pipeline::ChannelSource>,
        Arc::clone(&catalog) as Arc<dyn prismcast_core::pipeline::ProgramSource>,
        Arc::new(NoopIngestionTracker),
    );
    pipeline
        .logo_cache()
        .spawn_sweeper(Duration::from_secs(24 * 3600), shutdown.clone());

    // Listeners. Binding failures are unrecoverable startup errors.
    let http_listener = TcpListener::bind((config.bind_addr, config.http_port))
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", config.http_port))?;
    let control_listener = TcpListener::bind((config.bind_addr, config.control_port))
        .await
        .with_context(|| format!("Failed to bind control port {}", config.control_port))?;

    let state = AppState::new(
        Arc::clone(&sessions),
        pipeline,
        Arc::clone(&catalog) as Arc<dyn ProxyStore>,
        core_config,
        shutdown.clone(),
    );

    let control_handle = tokio::spawn(
        Arc::clone(&control).serve(control_listener, shutdown.clone()),
    );
    let http_handle = tokio::spawn(async move {
        if let Err(e) = start_server(state, http_listener).await {
            log::error!("HTTP server error: {e}");
        }
    });

    log::info!("Prismcast Server started");

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    shutdown.cancel();
    sessions.shutdown();
    let _ = http_handle.await;
    let _ = control_handle.await;

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
