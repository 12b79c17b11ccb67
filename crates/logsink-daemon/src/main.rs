//! logsink-daemon - issue-sink service
//!
//! Binary entry point: loads configuration, wires up the store and the
//! singleton workers, and serves the HTTP surface until SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use logsink_core::Config;
use logsink_daemon::http;
use logsink_daemon::AppState;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// logsink daemon - issue sink with semantic deduplication
#[derive(Parser, Debug)]
#[command(name = "logsink-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "logsink.toml")]
    config: PathBuf,

    /// Override the configured HTTP port
    #[arg(long)]
    port: Option<u16>,

    /// Log filter directive (overrides the configured log level)
    #[arg(long)]
    log_level: Option<String>,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(args: &Args, config: &Config) -> Result<()> {
    let directive = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.0.clone());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        Config::from_file(&args.config).context("failed to load configuration")?
    } else {
        Config::from_env()
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_tracing(&args, &config)?;
    if !args.config.exists() {
        info!(path = %args.config.display(), "no config file found, using defaults");
    }
    if config.server.api_key.is_none() {
        warn!("no API key configured, authentication is disabled");
    }

    let state = AppState::build(config.clone()).context("failed to initialize daemon state")?;
    state.spawn_workers();

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind HTTP listener")?;
    info!(
        addr = %addr,
        store = %config.store.path.display(),
        embedding_enabled = config.embedding.enabled,
        "logsink daemon started"
    );

    let app = http::router(Arc::clone(&state));
    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("shutdown signal received, draining workers");
            shutdown_state.request_shutdown();
        })
        .await
        .context("server error")?;

    info!("daemon shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "cannot register SIGTERM handler");
            std::future::pending().await
        },
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "cannot register SIGINT handler");
            std::future::pending().await
        },
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot wait for ctrl-c");
        std::future::pending::<()>().await;
    }
}
