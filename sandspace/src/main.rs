mod activity;
mod audit;
mod cli;
mod config;
mod error;
mod exec;
mod files;
mod history;
mod idle;
mod metrics;
mod network;
mod runtime;
mod space;
mod stats;
mod terminal;
mod web;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::activity::ActivityStore;
use crate::audit::AuditWriter;
use crate::config::Config;
use crate::history::HistoryIngestor;
use crate::idle::IdleMonitor;
use crate::metrics::MetricsRegistry;
use crate::network::{EgressFilter, SyncOutcome};
use crate::runtime::DockerRuntime;
use crate::space::SpaceManager;
use crate::web::AppState;

#[derive(Parser)]
#[command(name = "sandspace", about = "Control plane for policy-constrained Docker sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API, idle monitor and history ingestion.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify the engine, iptables and audit directory. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Converge the host egress filter onto the live spaces and exit.
    SyncEgress {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config: config_path } => {
            let config = cli::load_config(config_path)?;
            serve(config).await?;
        }
        Commands::Check { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_check(&config).await?;
        }
        Commands::SyncEgress { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_sync_egress(config).await?;
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let runtime = DockerRuntime::connect(&config.runtime.docker_socket)
        .context("connecting to the Docker engine")?;
    let version = runtime
        .ping()
        .await
        .context("Docker engine is not reachable")?;
    info!(version = %version, "connected to Docker engine");

    let egress = Arc::new(EgressFilter::system(&config.egress));
    let (audit, audit_writer) = AuditWriter::spawn(&config.audit);
    let manager = Arc::new(SpaceManager::new(
        config,
        Arc::new(runtime),
        Arc::new(ActivityStore::new()),
        audit,
        egress,
        MetricsRegistry::new(),
    ));

    // Spaces survive daemon restarts, so the host filter is rebuilt from them.
    match manager.sync_egress().await {
        Ok(SyncOutcome::Applied { rules }) => info!(rules, "egress filter synced"),
        Ok(SyncOutcome::Skipped) => {}
        Err(e) if manager.config().egress.required => {
            return Err(anyhow::Error::new(e).context("initial egress sync failed"));
        }
        Err(e) => warn!(error = %e, "initial egress sync failed"),
    }

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    match IdleMonitor::new(manager.clone(), &manager.config().idle) {
        Some(monitor) => tasks.push(monitor.spawn()),
        None => info!("idle monitor disabled"),
    }
    match HistoryIngestor::new(manager.clone(), &manager.config().history) {
        Some(ingestor) => tasks.push(ingestor.spawn()),
        None => info!("history ingestion disabled"),
    }

    let result = match web::start_server(Arc::new(AppState::new(manager.clone()))).await {
        Ok(server) => {
            tasks.push(server);
            wait_for_signal().await
        }
        Err(e) => Err(e.context("starting API server")),
    };

    // Graceful shutdown: always run regardless of how serving ended.
    for task in &tasks {
        task.abort();
    }
    if let Some(writer) = audit_writer {
        writer.shutdown().await;
    }
    info!("sandspace stopped");
    result
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for SIGINT")?;
            info!("received SIGINT, initiating shutdown");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
    Ok(())
}
