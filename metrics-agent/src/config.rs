//! Configuration management
//!
//! Handles:
//! - Server endpoint and pre-shared API key
//! - Source identity reported with every batch
//! - Retry, timeout and buffer retention knobs
//! - Command relay cadence and enabled commands
//! - TOML file + environment overrides, OS-specific default locations

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{CommandType, Source};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub delivery: DeliveryConfig,
    pub collection: CollectionConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Defaults to the hostname
    pub name: Option<String>,
    pub description: Option<String>,
    /// Defaults to the primary interface address
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Same delay before every retry
    Fixed,
    /// `retry_delay * attempt`
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffPolicy,
    pub buffer_path: Option<PathBuf>,
    pub buffer_max_records: usize,
    pub buffer_max_age_secs: Option<u64>,
    pub bulk_enabled: bool,
    pub bulk_max_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub interval_secs: u64,
    pub collector_timeout_secs: u64,
    pub system: bool,
    pub battery: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    /// Overrides the identity derived from the host
    pub client_id: Option<String>,
    pub poll_interval_secs: u64,
    /// Defaults to the poll interval
    pub heartbeat_interval_secs: Option<u64>,
    pub state_path: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub enabled_commands: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/api".to_string(),
            api_key: String::new(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5_000,
            backoff: BackoffPolicy::Fixed,
            buffer_path: None,
            buffer_max_records: 1000,
            buffer_max_age_secs: None,
            bulk_enabled: true,
            bulk_max_records: 50,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            collector_timeout_secs: 10,
            system: true,
            battery: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client_id: None,
            poll_interval_secs: 30,
            heartbeat_interval_secs: None,
            state_path: None,
            command_timeout_secs: 30,
            enabled_commands: vec!["ping".to_string()],
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

impl SourceConfig {
    /// Fills the gaps from discovered host identity
    pub fn resolve(&self, hostname: &str, discovered_ip: Option<String>) -> Source {
        Source {
            name: self.name.clone().unwrap_or_else(|| hostname.to_string()),
            description: self.description.clone(),
            ip_address: self.ip_address.clone().or(discovered_ip),
        }
    }
}

impl DeliveryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        match self.backoff {
            BackoffPolicy::Fixed => self.retry_delay(),
            BackoffPolicy::Linear => self.retry_delay() * retry.max(1),
        }
    }

    pub fn buffer_max_age(&self) -> Option<Duration> {
        self.buffer_max_age_secs.map(Duration::from_secs)
    }

    pub fn buffer_file(&self) -> PathBuf {
        self.buffer_path
            .clone()
            .unwrap_or_else(|| AgentConfig::data_dir().join("metrics_buffer.json"))
    }
}

impl CollectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn collector_timeout(&self) -> Duration {
        Duration::from_secs(self.collector_timeout_secs)
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.unwrap_or(self.poll_interval_secs))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| AgentConfig::data_dir().join("registration.json"))
    }

    /// Enabled names mapped onto the whitelist; unknown names are reported, not enabled
    pub fn enabled_command_types(&self) -> (Vec<CommandType>, Vec<String>) {
        let mut enabled = Vec::new();
        let mut rejected = Vec::new();
        for name in &self.enabled_commands {
            match CommandType::from(name.as_str()) {
                CommandType::Unsupported(name) => rejected.push(name),
                known => {
                    if !enabled.contains(&known) {
                        enabled.push(known);
                    }
                }
            }
        }
        (enabled, rejected)
    }
}

impl AgentConfig {
    /// Load config: explicit path, else `METRICS_AGENT_CONFIG`, else the OS config dir.
    /// A missing file means defaults. Environment overrides are applied last.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os("METRICS_AGENT_CONFIG") {
                Some(path) => PathBuf::from(path),
                None => Self::config_file_path()?,
            },
        };

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// `METRICS_*` environment variables win over the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("METRICS_SERVER_URL") {
            self.server.url = url;
        }
        if let Ok(key) = std::env::var("METRICS_API_KEY") {
            self.server.api_key = key;
        }
        if let Ok(client_id) = std::env::var("METRICS_CLIENT_ID") {
            self.relay.client_id = Some(client_id);
        }
        if let Ok(path) = std::env::var("METRICS_BUFFER_FILE") {
            self.delivery.buffer_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = std::env::var("METRICS_COLLECTION_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.collection.interval_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.url.trim().is_empty() {
            anyhow::bail!("server.url must not be empty");
        }
        if self.server.request_timeout_secs == 0 {
            anyhow::bail!("server.request_timeout_secs must be > 0");
        }
        if self.collection.interval_secs == 0 {
            anyhow::bail!("collection.interval_secs must be > 0");
        }
        if self.collection.collector_timeout_secs == 0 {
            anyhow::bail!("collection.collector_timeout_secs must be > 0");
        }
        if self.relay.poll_interval_secs == 0 {
            anyhow::bail!("relay.poll_interval_secs must be > 0");
        }
        if self.relay.command_timeout_secs == 0 {
            anyhow::bail!("relay.command_timeout_secs must be > 0");
        }
        if self.delivery.buffer_max_records == 0 {
            anyhow::bail!("delivery.buffer_max_records must be > 0");
        }
        if self.delivery.bulk_max_records == 0 {
            anyhow::bail!("delivery.bulk_max_records must be > 0");
        }
        Ok(())
    }

    /// OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("metrics-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// OS-specific directory for buffer and registration state
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("metrics-agent")
    }
}
