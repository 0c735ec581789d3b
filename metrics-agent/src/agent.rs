//! Agent assembly and run-loops
//!
//! The agent owns every component and runs two independent loops:
//! - metrics: flush what a previous run buffered, then collect and deliver on the collection interval
//! - relay: register/heartbeat/poll/execute on the poll interval
//!
//! Both stop between ticks once the shutdown signal fires.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::collector;
use crate::config::AgentConfig;
use crate::delivery::{DeliveryClient, DeliveryOutcome};
use crate::execution::CommandExecutor;
use crate::identity::HostIdentity;
use crate::manager::MetricsManager;
use crate::relay::{log_relay_error, CommandRelayClient, RegistrationStore, TickOutcome};

/// Cloneable trigger for a graceful stop
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

pub struct Agent {
    config: AgentConfig,
    client_id: String,
    delivery: Arc<DeliveryClient>,
    manager: MetricsManager,
    relay: Option<CommandRelayClient>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Agent {
    /// Discover the host and build every component with built-in collectors and handlers
    pub fn new(config: AgentConfig) -> Result<Self> {
        let identity = HostIdentity::discover();
        let (enabled, rejected) = config.relay.enabled_command_types();
        for name in rejected {
            warn!("Ignoring unknown command type '{}' in relay.enabled_commands", name);
        }
        let executor = CommandExecutor::with_builtins(&enabled, config.relay.command_timeout());
        Self::from_parts(config, &identity, executor)
    }

    /// Build from an explicit identity and executor (custom handlers)
    pub fn from_parts(
        config: AgentConfig,
        identity: &HostIdentity,
        executor: CommandExecutor,
    ) -> Result<Self> {
        let client_id = match &config.relay.client_id {
            Some(client_id) => client_id.clone(),
            None => RegistrationStore::new(config.relay.state_file())
                .resolve_client_id(|| identity.client_id())
                .context("Failed to resolve client id")?,
        };
        let source = config
            .source
            .resolve(&identity.hostname, identity.primary_ip.clone());

        let delivery = Arc::new(
            DeliveryClient::new(&config.server, config.delivery.clone(), &client_id)
                .context("Failed to create delivery client")?,
        );

        let mut manager = MetricsManager::new(
            Arc::clone(&delivery),
            source,
            config.collection.collector_timeout(),
        );
        for collector in collector::default_collectors(&config.collection) {
            manager.register_collector(collector);
        }

        let relay = if config.relay.enabled {
            Some(
                CommandRelayClient::new(
                    &config.server,
                    &config.relay,
                    &client_id,
                    &identity.hostname,
                    executor,
                )
                .context("Failed to create command relay")?,
            )
        } else {
            info!("Command relay disabled");
            None
        };

        let (shutdown, _) = watch::channel(false);
        info!(
            "Agent initialized - client id: {}, source: {}, server: {}",
            client_id,
            manager.source().name,
            config.server.base_url()
        );

        Ok(Self {
            config,
            client_id,
            delivery,
            manager,
            relay,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// For registering extra collectors before `run`
    pub fn manager_mut(&mut self) -> &mut MetricsManager {
        &mut self.manager
    }

    pub fn delivery(&self) -> Arc<DeliveryClient> {
        Arc::clone(&self.delivery)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Run until the shutdown handle fires
    pub async fn run(self) -> Result<()> {
        info!("Starting agent loops...");

        let metrics_task = tokio::spawn(metrics_loop(
            self.manager,
            Arc::clone(&self.delivery),
            self.config.collection.interval(),
            self.shutdown.subscribe(),
        ));
        let relay_task = self.relay.map(|relay| {
            tokio::spawn(relay_loop(
                relay,
                self.config.relay.poll_interval(),
                self.shutdown.subscribe(),
            ))
        });

        metrics_task.await.context("Metrics loop panicked")?;
        if let Some(task) = relay_task {
            task.await.context("Relay loop panicked")?;
        }

        info!(
            "Agent stopped ({} batches left in buffer)",
            self.delivery.buffered_count()
        );
        Ok(())
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Deliver what a previous run left behind; gives up early on shutdown
async fn startup_flush(delivery: &DeliveryClient, shutdown: &mut watch::Receiver<bool>) {
    if delivery.buffered_count() == 0 || *shutdown.borrow() {
        return;
    }
    tokio::select! {
        result = delivery.flush() => match result {
            Ok(report) => info!(
                "Startup flush: {} delivered, {} still buffered",
                report.delivered, report.remaining
            ),
            Err(e) => error!("Startup flush failed: {}", e),
        },
        _ = shutdown.changed() => debug!("Startup flush interrupted by shutdown"),
    }
}

async fn metrics_loop(
    manager: MetricsManager,
    delivery: Arc<DeliveryClient>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    startup_flush(&delivery, &mut shutdown).await;

    let mut ticker = ticker(period);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                match manager.collect_and_send().await {
                    Ok(report) => match report.outcome {
                        DeliveryOutcome::Sent { flushed } => debug!(
                            "Sent {} metrics ({} buffered batches flushed)",
                            report.entries, flushed
                        ),
                        DeliveryOutcome::Buffered => debug!("Buffered {} metrics", report.entries),
                        DeliveryOutcome::Skipped => debug!("No metrics this round"),
                    },
                    Err(e) => error!("Metrics delivery failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Metrics loop stopped");
}

async fn relay_loop(mut relay: CommandRelayClient, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = ticker(period);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                match relay.tick().await {
                    Ok(TickOutcome::Idle) => {}
                    Ok(TickOutcome::Executed(result)) | Ok(TickOutcome::Replayed(result)) => {
                        debug!("Command {} finished: {:?}", result.command_id, result.status)
                    }
                    Err(e) => log_relay_error(&e, "Relay tick failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Relay loop stopped");
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
