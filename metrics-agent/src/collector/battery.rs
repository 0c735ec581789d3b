//! Battery charge from the Linux power-supply class (`/sys/class/power_supply/BAT*`)

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};

use super::{format_readings, Collector, Readings};
use crate::error::CollectorError;
use crate::models::MetricEntry;

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

#[derive(Debug, Clone)]
pub struct BatteryCollector {
    root: PathBuf,
}

impl BatteryCollector {
    pub fn new() -> Self {
        Self::with_root(POWER_SUPPLY_ROOT)
    }

    /// Read batteries below another directory instead of sysfs
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn find_battery(&self) -> Result<PathBuf, CollectorError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| CollectorError::Unavailable(format!("{}: {}", self.root.display(), e)))?;

        let mut batteries = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with("BAT") {
                batteries.push(entry.path());
            }
        }
        batteries.sort();
        batteries
            .into_iter()
            .next()
            .ok_or_else(|| CollectorError::Unavailable("no battery found".into()))
    }
}

impl Default for BatteryCollector {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_trimmed(path: &Path) -> Result<String, CollectorError> {
    tokio::fs::read_to_string(path)
        .await
        .map(|s| s.trim().to_string())
        .map_err(|e| CollectorError::Failed(format!("{}: {}", path.display(), e)))
}

#[async_trait]
impl Collector for BatteryCollector {
    fn name(&self) -> &str {
        "battery"
    }

    async fn collect(&self) -> Result<Readings, CollectorError> {
        let battery = self.find_battery().await?;

        let capacity_raw = read_trimmed(&battery.join("capacity")).await?;
        let capacity: f64 = capacity_raw
            .parse()
            .map_err(|_| CollectorError::Failed(format!("unreadable capacity '{}'", capacity_raw)))?;
        let status = read_trimmed(&battery.join("status")).await.unwrap_or_else(|_| "Unknown".into());

        let mut readings = Readings::new();
        readings.insert("percentage".into(), json!(capacity));
        readings.insert("is_charging".into(), json!(status == "Charging"));
        readings.insert("status".into(), json!(status));
        Ok(readings)
    }

    fn format(&self, readings: &Readings) -> Vec<MetricEntry> {
        format_readings(self.name(), readings)
            .into_iter()
            .map(|entry| {
                if entry.name == "battery.percentage" {
                    entry.with_unit("%").with_description("Remaining battery charge")
                } else {
                    entry
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_first_battery() {
        let dir = tempfile::tempdir().unwrap();
        let bat = dir.path().join("BAT0");
        std::fs::create_dir_all(&bat).unwrap();
        std::fs::write(bat.join("capacity"), "73\n").unwrap();
        std::fs::write(bat.join("status"), "Charging\n").unwrap();
        std::fs::create_dir_all(dir.path().join("AC")).unwrap();

        let collector = BatteryCollector::with_root(dir.path());
        let readings = collector.collect().await.unwrap();
        let entries = collector.format(&readings);

        let percentage = entries.iter().find(|e| e.name == "battery.percentage").unwrap();
        assert_eq!(percentage.value, 73.0);
        assert_eq!(percentage.unit.as_deref(), Some("%"));
        assert_eq!(percentage.metadata.get("status").map(String::as_str), Some("Charging"));

        let charging = entries.iter().find(|e| e.name == "battery.is_charging").unwrap();
        assert_eq!(charging.value, 1.0);
    }

    #[tokio::test]
    async fn test_no_battery_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let collector = BatteryCollector::with_root(dir.path());
        assert!(matches!(
            collector.collect().await,
            Err(CollectorError::Unavailable(_))
        ));
    }
}
