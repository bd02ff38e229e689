//! Switchyard: run the tool-server gateway from the command line.
//!
//! Three subcommands:
//! - `switchyard serve`: start every server and keep them supervised until Ctrl-C
//! - `switchyard status`: start, print server status and pool stats as JSON, stop
//! - `switchyard route <method>`: start, print the routing decision for a method, stop

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use nimbus_switchyard::{EventSink, Gateway, GatewayConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Switchyard: local gateway for MCP tool servers.
#[derive(Parser)]
#[command(
    name = "switchyard",
    version,
    about = "Switchyard: local gateway for MCP tool servers"
)]
struct Cli {
    /// Path to switchyard.toml [default: ./switchyard.toml or ~/.config/switchyard/switchyard.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all servers and supervise them until interrupted
    Serve,
    /// Print per-server status and pool statistics as JSON
    Status,
    /// Show which server a method would be routed to
    Route {
        /// Method name, e.g. `git.status`
        method: String,
        /// Validate an explicit server instead of matching rules
        #[arg(short, long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with env filter (RUST_LOG controls verbosity)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // Ctrl-C handler cancels the root token for graceful shutdown
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutting down Switchyard...");
        cancel_for_signal.cancel();
    });

    let config_path = resolve_config(cli.config)?;
    let config = load_config(&config_path).await?;

    match cli.command {
        Commands::Serve => run_serve(config, cancel).await?,
        Commands::Status => run_status(config).await?,
        Commands::Route { method, server } => run_route(config, &method, server.as_deref()).await?,
    }

    Ok(())
}

/// Start every server, forward gateway events to the log, and stop on Ctrl-C.
async fn run_serve(config: GatewayConfig, cancel: CancellationToken) -> Result<()> {
    let (events, mut rx) = EventSink::channel(config.event_buffer);
    let gateway = Gateway::from_config(config, events)
        .map_err(|e| anyhow::anyhow!("Failed to build gateway: {}", e))?;

    let log_cancel = cancel.clone();
    let event_log = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_event = rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    match serde_json::to_string(&event) {
                        Ok(json) => tracing::info!(server = %event.server_id(), event = %json, "gateway event"),
                        Err(e) => tracing::warn!(error = %e, "failed to serialize gateway event"),
                    }
                }
                _ = log_cancel.cancelled() => break,
            }
        }
    });

    gateway.start_all().await;
    tracing::info!("Switchyard running, press Ctrl-C to stop");

    cancel.cancelled().await;
    gateway.stop_all().await;
    event_log.abort();

    tracing::info!("Switchyard stopped");
    Ok(())
}

/// Start every server, print status and pool stats, then stop.
async fn run_status(config: GatewayConfig) -> Result<()> {
    let gateway = Gateway::from_config(config, EventSink::disabled())
        .map_err(|e| anyhow::anyhow!("Failed to build gateway: {}", e))?;

    gateway.start_all().await;
    let report = serde_json::json!({
        "servers": gateway.get_status().await,
        "pools": gateway.all_pool_stats().await,
    });
    gateway.stop_all().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Start every server, print the routing decision for `method`, then stop.
async fn run_route(config: GatewayConfig, method: &str, server: Option<&str>) -> Result<()> {
    let gateway = Gateway::from_config(config, EventSink::disabled())
        .map_err(|e| anyhow::anyhow!("Failed to build gateway: {}", e))?;

    gateway.start_all().await;
    let rendered = match server {
        Some(explicit) => gateway
            .route(method, Some(explicit))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|selected| {
                let decision = serde_json::json!({ "method": method, "selected": selected });
                Ok(serde_json::to_string_pretty(&decision)?)
            }),
        None => gateway
            .test_routing(method)
            .await
            .map_err(anyhow::Error::from)
            .and_then(|decision| Ok(serde_json::to_string_pretty(&decision)?)),
    };
    gateway.stop_all().await;

    let rendered = rendered.map_err(|e| anyhow::anyhow!("Routing failed: {}", e))?;
    println!("{}", rendered);
    Ok(())
}

/// Resolve config file path: explicit flag → ./switchyard.toml → ~/.config/switchyard/switchyard.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("switchyard.toml");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("switchyard").join("switchyard.toml");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "No switchyard.toml found. Searched ./switchyard.toml and ~/.config/switchyard/switchyard.toml. \
         Use --config to specify a path."
    ))
}

/// Load and parse a switchyard.toml config file.
async fn load_config(config_path: &Path) -> Result<GatewayConfig> {
    GatewayConfig::load(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config file {:?}: {}", config_path, e))
}
