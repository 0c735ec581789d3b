//! Metrics Agent binary
//!
//! Usage: `metrics-agent [config.toml]`; without an argument the config comes
//! from `METRICS_AGENT_CONFIG` or the OS config directory.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use metrics_agent::agent::shutdown_signal;
use metrics_agent::{Agent, AgentConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("metrics_agent=info")),
        )
        .init();

    info!("Metrics Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AgentConfig::load(config_path.as_deref())
        .await
        .context("Failed to load configuration")?;

    let agent = Agent::new(config).context("Failed to create agent")?;

    let shutdown = agent.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down after the current tick...");
        shutdown.trigger();
    });

    agent.run().await.context("Agent execution failed")?;
    Ok(())
}
