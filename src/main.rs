//! Daemon entry point: config, store, registry, timers, gateway.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keysteward::aggregator::CostAggregator;
use keysteward::billing::{AnthropicBillingClient, BillingApi};
use keysteward::config::Config;
use keysteward::gateway::{self, AppState};
use keysteward::lifecycle::LifecycleManager;
use keysteward::registry::Registry;
use keysteward::store::StateStore;

#[derive(Parser)]
#[command(name = "keysteward", version, about = "Spend-limited API credential rationing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: gateway, aggregation timer, lifecycle timer.
    Serve {
        /// Path to keysteward.toml (defaults to the user config dir).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the gateway port.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, port } => serve(config.as_deref(), port).await,
    }
}

async fn serve(config_path: Option<&std::path::Path>, port_override: Option<u16>) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let store = Arc::new(StateStore::open(&data_dir.join("keysteward.db"))?);
    let registry = Arc::new(Registry::open(Arc::clone(&store))?);
    let billing: Arc<dyn BillingApi> = Arc::new(AnthropicBillingClient::new(
        &config.billing.base_url,
        Arc::clone(&store),
        Duration::from_secs(config.billing.request_timeout_secs),
    )?);

    let aggregator = Arc::new(CostAggregator::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&billing),
        config.aggregation.clone(),
    ));
    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&registry),
        Arc::clone(&billing),
        config.lifecycle.clone(),
    ));

    let (token_hash, fresh_token) = gateway::ensure_gateway_token(&store)?;
    if let Some(token) = fresh_token {
        // Printed exactly once; afterwards only the hash exists on disk.
        tracing::info!("generated gateway admin token: {token}");
    }

    // Independent timers. Aborting them at shutdown abandons any in-flight
    // cycle; the checkpoint only ever moves inside a committed merge.
    let aggregation_task = tokio::spawn(Arc::clone(&aggregator).run());
    let lifecycle_task = tokio::spawn(Arc::clone(&lifecycle).run());

    let state = Arc::new(AppState {
        registry,
        store,
        aggregator,
        billing,
        token_hash,
    });
    let app = gateway::router(state);

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .context("invalid gateway bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    aggregation_task.abort();
    lifecycle_task.abort();
    Ok(())
}
