mod common;

use async_trait::async_trait;
use common::{agent_config, CLIENT_ID};
use metrics_agent::collector::{Collector, Readings};
use metrics_agent::config::AgentConfig;
use metrics_agent::error::CollectorError;
use metrics_agent::execution::CommandExecutor;
use metrics_agent::identity::HostIdentity;
use metrics_agent::models::CommandType;
use metrics_agent::Agent;
use metrics_devkit::{init_logging, state_dir, wait_for, within, MockAggregator};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct Uptime;

#[async_trait]
impl Collector for Uptime {
    fn name(&self) -> &str {
        "uptime"
    }

    async fn collect(&self) -> Result<Readings, CollectorError> {
        let mut readings = Readings::new();
        readings.insert("seconds".into(), json!(1234));
        Ok(readings)
    }
}

struct Sensor;

#[async_trait]
impl Collector for Sensor {
    fn name(&self) -> &str {
        "sensor"
    }

    async fn collect(&self) -> Result<Readings, CollectorError> {
        Err(CollectorError::Unavailable("no sensor attached".into()))
    }
}

fn identity() -> HostIdentity {
    HostIdentity {
        hostname: "test-host".into(),
        primary_mac: None,
        primary_ip: Some("10.0.0.9".into()),
        interfaces: Vec::new(),
    }
}

fn config(mock: &MockAggregator, dir: &Path) -> AgentConfig {
    let mut config = agent_config(&mock.url(), dir);
    config.collection.interval_secs = 1;
    config.relay.poll_interval_secs = 1;
    config
}

fn agent(mock: &MockAggregator, dir: &Path) -> Agent {
    build(config(mock, dir), &identity())
}

fn build(config: AgentConfig, identity: &HostIdentity) -> Agent {
    let executor = CommandExecutor::with_builtins(&[CommandType::Ping], Duration::from_secs(5));
    let mut agent = Agent::from_parts(config, identity, executor).unwrap();
    agent.manager_mut().register_collector(Arc::new(Uptime));
    agent.manager_mut().register_collector(Arc::new(Sensor));
    agent
}

#[tokio::test]
async fn test_agent_delivers_metrics_and_answers_commands() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let agent = agent(&mock, dir.path());
    assert_eq!(agent.client_id(), CLIENT_ID);

    let shutdown = agent.shutdown_handle();
    mock.push_command(CLIENT_ID, "agent-ping", "ping", json!({}));
    let running = tokio::spawn(agent.run());

    // the broken collector must not hold back the healthy one
    assert!(
        wait_for(Duration::from_secs(5), || {
            let names = mock.delivered_metric_names();
            names.iter().any(|n| n == "uptime.seconds") && names.iter().any(|n| n == "sensor.error")
        })
        .await
    );
    assert!(wait_for(Duration::from_secs(5), || !mock.results().is_empty()).await);

    let (_, body) = &mock.deliveries()[0];
    assert_eq!(body["source"]["name"], "test-host");
    assert_eq!(body["source"]["ip_address"], "10.0.0.9");
    let error_entry = body["metrics"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["name"] == "sensor.error")
        .cloned()
        .unwrap();
    assert_eq!(error_entry["metadata"]["collector"], "sensor");

    let results = mock.results();
    assert_eq!(results[0].command_id, "agent-ping");
    assert_eq!(results[0].body["output"], "pong");
    assert_eq!(mock.registrations().len(), 1);

    shutdown.trigger();
    within(Duration::from_secs(5), running).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_agent_flushes_buffer_left_by_previous_run() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();

    mock.set_offline(true);
    {
        let agent = agent(&mock, dir.path());
        let delivery = agent.delivery();
        delivery.send(common::batch("from-last-run")).await.unwrap();
        assert_eq!(delivery.buffered_count(), 1);
    }

    mock.set_offline(false);
    let agent = agent(&mock, dir.path());
    let delivery = agent.delivery();
    let shutdown = agent.shutdown_handle();
    let running = tokio::spawn(agent.run());

    assert!(wait_for(Duration::from_secs(5), || delivery.buffered_count() == 0).await);
    assert_eq!(mock.delivered_metric_names().first().map(String::as_str), Some("from-last-run"));

    shutdown.trigger();
    within(Duration::from_secs(5), running).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_before_run_returns_promptly() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let agent = agent(&mock, dir.path());

    agent.shutdown_handle().trigger();
    within(Duration::from_secs(2), agent.run()).await.unwrap();
}

#[tokio::test]
async fn test_stuck_startup_flush_does_not_hold_up_commands_or_shutdown() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();

    mock.set_offline(true);
    {
        let agent = agent(&mock, dir.path());
        agent.delivery().send(common::batch("stuck")).await.unwrap();
    }
    mock.set_offline(false);
    mock.answer_metric_with("stuck", 503);

    // three attempts two seconds apart keep the flush busy for several seconds
    let mut config = config(&mock, dir.path());
    config.delivery.retry_delay_ms = 2_000;
    let agent = build(config, &identity());
    let delivery = agent.delivery();
    let shutdown = agent.shutdown_handle();
    mock.push_command(CLIENT_ID, "during-flush", "ping", json!({}));
    let running = tokio::spawn(agent.run());

    assert!(wait_for(Duration::from_millis(1500), || !mock.results().is_empty()).await);
    assert_eq!(mock.results()[0].command_id, "during-flush");
    assert_eq!(delivery.buffered_count(), 1);
    assert!(mock.delivered_metric_names().is_empty());

    shutdown.trigger();
    within(Duration::from_secs(1), running).await.unwrap().unwrap();
    assert_eq!(delivery.buffered_count(), 1);
}

#[tokio::test]
async fn test_client_id_is_kept_when_the_primary_interface_changes() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let mut config = config(&mock, dir.path());
    config.relay.client_id = None;

    let docked = HostIdentity {
        primary_mac: Some("aa:bb:cc:dd:ee:01".into()),
        ..identity()
    };
    let first = build(config.clone(), &docked);
    assert_eq!(first.client_id(), "aabbccddee01");
    drop(first);

    // undocked: the primary interface is now a different adapter
    let undocked = HostIdentity {
        primary_mac: Some("aa:bb:cc:dd:ee:02".into()),
        ..identity()
    };
    let second = build(config.clone(), &undocked);
    assert_eq!(second.client_id(), "aabbccddee01");

    let shutdown = second.shutdown_handle();
    let running = tokio::spawn(second.run());
    assert!(wait_for(Duration::from_secs(5), || !mock.registrations().is_empty()).await);
    assert_eq!(mock.registrations()[0]["client_id"], "aabbccddee01");
    shutdown.trigger();
    within(Duration::from_secs(5), running).await.unwrap().unwrap();

    // no interface at all still resolves to the stored id
    assert_eq!(build(config, &identity()).client_id(), "aabbccddee01");
}
