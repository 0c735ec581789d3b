//! Host resource metrics via `sysinfo`
//!
//! CPU usage and load averages, memory and swap, root filesystem usage, uptime.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::debug;

use super::{format_readings, Collector, Readings};
use crate::error::CollectorError;
use crate::models::MetricEntry;

const MB: f64 = 1024.0 * 1024.0;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Default)]
pub struct SystemCollector;

impl SystemCollector {
    pub fn new() -> Self {
        Self
    }
}

fn percent(part: f64, total: f64) -> f64 {
    if total > 0.0 {
        part / total * 100.0
    } else {
        0.0
    }
}

fn unit_for(key: &str) -> Option<&'static str> {
    if key.ends_with("_percent") {
        Some("%")
    } else if key.ends_with("_mb") {
        Some("MB")
    } else if key.ends_with("_gb") {
        Some("GB")
    } else if key.ends_with("_seconds") {
        Some("s")
    } else {
        None
    }
}

#[async_trait]
impl Collector for SystemCollector {
    fn name(&self) -> &str {
        "system"
    }

    async fn collect(&self) -> Result<Readings, CollectorError> {
        debug!("Collecting system metrics...");

        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        // CPU usage is a delta between two refreshes
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu();

        let mut readings = Readings::new();
        readings.insert("cpu_percent".into(), json!(sys.global_cpu_info().cpu_usage() as f64));
        readings.insert("cpu_cores".into(), json!(sys.cpus().len()));

        if cfg!(unix) {
            let load = System::load_average();
            readings.insert("load_1m".into(), json!(load.one));
            readings.insert("load_5m".into(), json!(load.five));
            readings.insert("load_15m".into(), json!(load.fifteen));
        }

        let total = sys.total_memory() as f64;
        let available = sys.available_memory() as f64;
        if total <= 0.0 {
            return Err(CollectorError::Unavailable("memory statistics".into()));
        }
        readings.insert("memory_total_mb".into(), json!(total / MB));
        readings.insert("memory_used_mb".into(), json!((total - available) / MB));
        readings.insert("memory_used_percent".into(), json!(percent(total - available, total)));
        readings.insert("swap_used_mb".into(), json!(sys.used_swap() as f64 / MB));

        let disks = Disks::new_with_refreshed_list();
        if let Some(root) = disks.list().iter().find(|d| d.mount_point() == Path::new("/")) {
            let disk_total = root.total_space() as f64;
            let disk_used = disk_total - root.available_space() as f64;
            readings.insert("disk_root_total_gb".into(), json!(disk_total / GB));
            readings.insert("disk_root_used_percent".into(), json!(percent(disk_used, disk_total)));
        }

        readings.insert("uptime_seconds".into(), json!(System::uptime()));
        if let Some(os) = System::long_os_version() {
            readings.insert("os".into(), json!(os));
        }

        Ok(readings)
    }

    fn format(&self, readings: &Readings) -> Vec<MetricEntry> {
        format_readings(self.name(), readings)
            .into_iter()
            .map(|entry| {
                let key = entry.name.trim_start_matches("system.").to_string();
                match unit_for(&key) {
                    Some(unit) => entry.with_unit(unit),
                    None => entry,
                }
            })
            .collect()
    }
}
