//! tether orchestrator daemon
//!
//! Serves the dashboard API on the local HTTP listener and owns every
//! terminal session, reverse tunnel and remote hook installation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_core::config::{self, OrchestratorConfig};
use tether_orchestrator::{api, OrchestratorState};

#[derive(Parser)]
#[command(name = "tether-orchestrator")]
#[command(about = "tether orchestrator daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("tether orchestrator v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                OrchestratorConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            OrchestratorConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.http_bind = bind;
    }
    tracing::info!(
        "{} machine(s) configured, tunnel ports {}-{}",
        config.machines.len(),
        config.tunnel.port_range_start,
        config.tunnel.port_range_end
    );

    let listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_bind))?;

    let (state, exits) = OrchestratorState::new(config);
    let state = Arc::new(state);

    // Ends the SSE streams too, otherwise graceful shutdown never drains
    let cancel = state.cancel.clone();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let exit_listener = tokio::spawn(
        state
            .controller
            .clone()
            .run_exit_listener(exits, cancel.clone()),
    );

    let app = api::router(state.clone());
    tracing::info!("Listening on {}", state.config.local_url());

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    state.shutdown().await;
    let _ = exit_listener.await;

    tracing::info!("Orchestrator shutdown complete");
    Ok(())
}
