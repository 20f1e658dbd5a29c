//! tether: pull files from machines that can only dial out.
//!
//! `tether relay` runs the public side: an HTTP API for callers and a
//! WebSocket listener agents attach to. `tether agent` runs on the machine
//! holding the files.

mod cli;
mod config;
mod sample;

use crate::cli::{Cli, Commands};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tether_agent::AgentClient;
use tether_api::{AppState, DownloadStore};
use tether_types::config::RelayConfig;
use tether_wire::{AgentRegistry, RegistryEvent, RelayNode, RequestCorrelator};
use tokio::sync::{broadcast, watch};
use tracing::info;

fn init_tracing_stderr(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Flip the returned watch to true on Ctrl+C.
fn install_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                let _ = tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for Ctrl+C");
                // Keep the sender alive so receivers do not read this as shutdown.
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing_stderr(cli.json_logs);

    match cli.command {
        Commands::Relay {
            http_listen,
            agent_listen,
            downloads_dir,
            timeout_secs,
        } => {
            let mut relay = config::load_config(cli.config.as_deref()).relay;
            if let Some(addr) = http_listen {
                relay.http_listen = addr;
            }
            if let Some(addr) = agent_listen {
                relay.agent_listen = addr;
            }
            if let Some(dir) = downloads_dir {
                relay.downloads_dir = dir;
            }
            if let Some(secs) = timeout_secs {
                relay.request_timeout_secs = secs;
            }
            run_relay(relay, install_shutdown_signal()).await
        }
        Commands::Agent {
            server_url,
            id,
            name,
        } => {
            let mut agent = config::load_config(cli.config.as_deref()).agent;
            if let Some(url) = server_url {
                agent.server_url = url;
            }
            if id.is_some() {
                agent.agent_id = id;
            }
            if name.is_some() {
                agent.name = name;
            }
            let client = AgentClient::new(agent).context("invalid agent configuration")?;
            info!(agent_id = client.agent_id(), name = client.name(), "Agent identity");
            client.run(install_shutdown_signal()).await;
            Ok(())
        }
        Commands::SampleFile { path, size_mb } => {
            let written = sample::write_sample_file(&path, size_mb)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote {written} bytes to {}", path.display());
            Ok(())
        }
    }
}

async fn run_relay(config: RelayConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let registry = AgentRegistry::new();
    let correlator = RequestCorrelator::new(registry.clone(), config.request_timeout());

    let (_node, accept_task) = RelayNode::start(&config, correlator.clone(), shutdown.clone())
        .await
        .with_context(|| format!("failed to bind agent listener on {}", config.agent_listen))?;
    let listener = tokio::net::TcpListener::bind(config.http_listen)
        .await
        .with_context(|| format!("failed to bind HTTP API on {}", config.http_listen))?;

    tokio::spawn(log_fleet(registry.clone(), registry.subscribe()));

    let state = Arc::new(AppState {
        correlator,
        store: DownloadStore::new(config.downloads_dir.clone()),
        default_chunk_size: config.default_chunk_size,
    });
    info!(
        downloads = %config.downloads_dir.display(),
        timeout_secs = config.request_timeout_secs,
        "Relay ready"
    );

    tether_api::serve(listener, state, shutdown)
        .await
        .context("HTTP API failed")?;
    let _ = accept_task.await;
    info!("Relay stopped");
    Ok(())
}

/// Log fleet size whenever an agent comes or goes.
async fn log_fleet(registry: AgentRegistry, mut events: broadcast::Receiver<RegistryEvent>) {
    loop {
        match events.recv().await {
            Ok(_) => info!(
                connected = registry.connected_count(),
                known = registry.total_count(),
                "Fleet changed"
            ),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
