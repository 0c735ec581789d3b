//! Collection round orchestration
//!
//! Every registered collector runs in its own task under the collector timeout.
//! A collector failing (error, timeout, panic) turns into a `<name>.error` entry;
//! the round itself always produces one batch for the delivery client.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collector::Collector;
use crate::delivery::{DeliveryClient, DeliveryOutcome};
use crate::error::{CollectorError, DeliveryError};
use crate::models::{MetricBatch, MetricEntry, Source};

/// Summary of one `collect_and_send` round
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionReport {
    pub entries: usize,
    pub failed_collectors: Vec<String>,
    pub outcome: DeliveryOutcome,
}

pub struct MetricsManager {
    collectors: Vec<Arc<dyn Collector>>,
    delivery: Arc<DeliveryClient>,
    source: Source,
    collector_timeout: Duration,
}

impl MetricsManager {
    pub fn new(delivery: Arc<DeliveryClient>, source: Source, collector_timeout: Duration) -> Self {
        Self {
            collectors: Vec::new(),
            delivery,
            source,
            collector_timeout,
        }
    }

    pub fn register_collector(&mut self, collector: Arc<dyn Collector>) {
        if self.collectors.iter().any(|c| c.name() == collector.name()) {
            warn!(
                "Collector '{}' registered twice, entries will be duplicated",
                collector.name()
            );
        }
        info!("Registered collector: {}", collector.name());
        self.collectors.push(collector);
    }

    pub fn collector_names(&self) -> Vec<String> {
        self.collectors.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Run every collector once; returns the round's batch and the collectors that failed
    pub async fn collect(&self) -> (MetricBatch, Vec<String>) {
        let timeout = self.collector_timeout;

        let tasks: Vec<_> = self
            .collectors
            .iter()
            .map(|collector| {
                let collector = Arc::clone(collector);
                let name = collector.name().to_string();
                let task = tokio::spawn(async move {
                    match tokio::time::timeout(timeout, collector.collect()).await {
                        Ok(Ok(readings)) => checked(collector.format(&readings)),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(CollectorError::Timeout(timeout.as_secs())),
                    }
                });
                (name, task)
            })
            .collect();

        let mut entries = Vec::new();
        let mut failed = Vec::new();
        for (name, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    debug!("Collector task {} ended abnormally: {}", name, join_error);
                    Err(CollectorError::Panicked)
                }
            };

            match result {
                Ok(produced) => {
                    debug!("Collector {} produced {} entries", name, produced.len());
                    entries.extend(produced);
                }
                Err(e) => {
                    warn!("Collector {} failed: {}", name, e);
                    entries.push(error_entry(&name, &e));
                    failed.push(name);
                }
            }
        }

        (MetricBatch::new(self.source.clone(), entries), failed)
    }

    /// One tick: collect, then hand the batch to the delivery client
    pub async fn collect_and_send(&self) -> Result<CollectionReport, DeliveryError> {
        let (batch, failed_collectors) = self.collect().await;
        let entries = batch.len();
        let outcome = self.delivery.send(batch).await?;

        debug!("Collection round: {} entries, outcome {:?}", entries, outcome);
        Ok(CollectionReport {
            entries,
            failed_collectors,
            outcome,
        })
    }
}

/// All of a collector's entries, or the first reason one of them cannot go on the wire
fn checked(entries: Vec<MetricEntry>) -> Result<Vec<MetricEntry>, CollectorError> {
    for entry in &entries {
        entry.validate().map_err(CollectorError::InvalidEntry)?;
    }
    Ok(entries)
}

fn error_entry(collector: &str, error: &CollectorError) -> MetricEntry {
    MetricEntry::new(format!("{}.error", collector), 1.0)
        .with_description("Collector failed during this round")
        .with_metadata("error", error.to_string())
        .with_metadata("collector", collector)
}
