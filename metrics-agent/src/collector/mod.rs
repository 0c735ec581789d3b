//! Collector capability and the built-in collectors
//!
//! A collector reports a flat map of readings; the manager turns them into
//! `MetricEntry`s named `<collector>.<key>`. Adding a new metric source means
//! implementing `Collector` and registering it on the manager.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::CollectionConfig;
use crate::error::CollectorError;
use crate::models::MetricEntry;

pub mod battery;
pub mod system;

pub use battery::BatteryCollector;
pub use system::SystemCollector;

/// Measurement name -> value. Numbers and booleans become metric values,
/// strings become metadata on every entry of the collector.
pub type Readings = BTreeMap<String, Value>;

#[async_trait]
pub trait Collector: Send + Sync {
    /// Prefix of every entry this collector produces
    fn name(&self) -> &str;

    async fn collect(&self) -> Result<Readings, CollectorError>;

    fn format(&self, readings: &Readings) -> Vec<MetricEntry> {
        format_readings(self.name(), readings)
    }
}

/// Default reading -> entry mapping shared by collectors that don't override `format`
pub fn format_readings(collector: &str, readings: &Readings) -> Vec<MetricEntry> {
    let labels: Vec<(&String, &str)> = readings
        .iter()
        .filter_map(|(key, value)| value.as_str().map(|s| (key, s)))
        .collect();

    let mut entries = Vec::new();
    for (key, value) in readings {
        let numeric = match value {
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(_) => continue,
            other => {
                debug!("Skipping non-scalar reading {}.{}: {}", collector, key, other);
                None
            }
        };
        let Some(numeric) = numeric else { continue };

        let mut entry = MetricEntry::new(format!("{}.{}", collector, key), numeric);
        for (label, text) in &labels {
            entry = entry.with_metadata(label.as_str(), *text);
        }
        entries.push(entry);
    }
    entries
}

/// Collectors enabled in configuration
pub fn default_collectors(config: &CollectionConfig) -> Vec<Arc<dyn Collector>> {
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();
    if config.system {
        collectors.push(Arc::new(SystemCollector::new()));
    }
    if config.battery {
        collectors.push(Arc::new(BatteryCollector::new()));
    }
    collectors
}
