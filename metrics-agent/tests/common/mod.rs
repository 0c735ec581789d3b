#![allow(dead_code)]

use metrics_agent::config::{AgentConfig, DeliveryConfig, RelayConfig, ServerConfig};
use metrics_agent::models::{MetricBatch, MetricEntry, Source};
use std::path::Path;

pub const API_KEY: &str = "test-key";
pub const CLIENT_ID: &str = "a1b2c3d4e5f6";

pub fn server(url: &str) -> ServerConfig {
    ServerConfig {
        url: url.to_string(),
        api_key: API_KEY.to_string(),
        request_timeout_secs: 2,
    }
}

pub fn delivery(dir: &Path) -> DeliveryConfig {
    DeliveryConfig {
        max_retries: 2,
        retry_delay_ms: 5,
        buffer_path: Some(dir.join("metrics_buffer.json")),
        ..DeliveryConfig::default()
    }
}

pub fn relay(dir: &Path, enabled_commands: &[&str]) -> RelayConfig {
    RelayConfig {
        state_path: Some(dir.join("registration.json")),
        command_timeout_secs: 5,
        enabled_commands: enabled_commands.iter().map(|s| s.to_string()).collect(),
        ..RelayConfig::default()
    }
}

pub fn agent_config(url: &str, dir: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.server = server(url);
    config.delivery = delivery(dir);
    config.relay = relay(dir, &["ping"]);
    config.relay.client_id = Some(CLIENT_ID.to_string());
    config.source.name = Some("test-host".to_string());
    config.collection.system = false;
    config.collection.battery = false;
    config
}

pub fn source() -> Source {
    Source {
        name: "test-host".into(),
        description: Some("integration test".into()),
        ip_address: Some("10.0.0.9".into()),
    }
}

/// Batch with one entry named `name`, so arrival order can be read back from the server
pub fn batch(name: &str) -> MetricBatch {
    MetricBatch::new(source(), vec![MetricEntry::new(name, 1.0).with_unit("count")])
}
