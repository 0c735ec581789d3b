mod common;

use async_trait::async_trait;
use common::{relay, server, CLIENT_ID};
use metrics_agent::error::{ExecutionError, RelayError};
use metrics_agent::execution::{CommandExecutor, CommandHandler};
use metrics_agent::models::{CommandStatus, CommandType};
use metrics_agent::relay::RegistrationStore;
use metrics_agent::{CommandRelayClient, TickOutcome};
use metrics_devkit::{init_logging, state_dir, EmptyPoll, MockAggregator};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Ping stand-in that counts how often it really ran
struct CountingPing(Arc<AtomicUsize>);

#[async_trait]
impl CommandHandler for CountingPing {
    async fn handle(&self, _args: &HashMap<String, String>) -> Result<String, ExecutionError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok("pong".into())
    }
}

fn relay_client(mock: &MockAggregator, dir: &Path) -> CommandRelayClient {
    let config = relay(dir, &["ping"]);
    let executor = CommandExecutor::with_builtins(&[CommandType::Ping], Duration::from_secs(5));
    CommandRelayClient::new(&server(&mock.url()), &config, CLIENT_ID, "test-host", executor).unwrap()
}

fn counting_client(mock: &MockAggregator, dir: &Path, runs: &Arc<AtomicUsize>) -> CommandRelayClient {
    let config = relay(dir, &["ping"]);
    let mut executor = CommandExecutor::new(Duration::from_secs(5));
    executor
        .register(CommandType::Ping, Arc::new(CountingPing(Arc::clone(runs))))
        .unwrap();
    CommandRelayClient::new(&server(&mock.url()), &config, CLIENT_ID, "test-host", executor).unwrap()
}

#[tokio::test]
async fn test_register_once_per_session() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let mut client = relay_client(&mock, dir.path());

    client.register().await.unwrap();
    client.register().await.unwrap();

    let registrations = mock.registrations();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0]["client_id"], CLIENT_ID);
    assert_eq!(registrations[0]["hostname"], "test-host");
    assert_eq!(registrations[0]["client_type"], "metrics_client");
    assert!(client.is_registered());
    assert!(client.registration().registered_at.is_some());
}

#[tokio::test]
async fn test_every_empty_poll_shape_means_no_command() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let mut client = relay_client(&mock, dir.path());
    client.register().await.unwrap();

    for style in [
        EmptyPoll::NoContent,
        EmptyPoll::EmptyBody,
        EmptyPoll::Null,
        EmptyPoll::CommandNull,
    ] {
        mock.set_empty_poll(style);
        assert!(client.poll().await.unwrap().is_none(), "{:?}", style);
    }
    assert_eq!(client.tick().await.unwrap(), TickOutcome::Idle);
}

#[tokio::test]
async fn test_ping_is_executed_and_reported() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let mut client = relay_client(&mock, dir.path());

    client.register().await.unwrap();
    mock.push_command(CLIENT_ID, "cmd-1", "ping", json!({}));

    let TickOutcome::Executed(result) = client.tick().await.unwrap() else {
        panic!("expected the ping to run");
    };
    assert_eq!(result.command_id, "cmd-1");
    assert_eq!(result.status, CommandStatus::Succeeded);
    assert_eq!(result.output.as_deref(), Some("pong"));

    let results = mock.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].command_id, "cmd-1");
    assert_eq!(results[0].body["status"], "succeeded");
    assert_eq!(mock.pending_commands(CLIENT_ID), 0);

    let stored = RegistrationStore::new(dir.path().join("registration.json"))
        .load(CLIENT_ID)
        .unwrap();
    assert_eq!(stored.last_command_id.as_deref(), Some("cmd-1"));
}

#[tokio::test]
async fn test_wrapped_command_is_accepted() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    mock.set_wrap_commands(true);
    let dir = state_dir();
    let mut client = relay_client(&mock, dir.path());

    client.register().await.unwrap();
    mock.push_command(CLIENT_ID, "wrapped-1", "ping", json!({}));

    let command = client.poll().await.unwrap().unwrap();
    assert_eq!(command.id, "wrapped-1");
    assert_eq!(command.command_type, CommandType::Ping);
}

#[tokio::test]
async fn test_unknown_and_disabled_commands_fail() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let mut client = relay_client(&mock, dir.path());

    mock.push_command(CLIENT_ID, "cmd-x", "format_disk", json!({}));
    mock.push_command(CLIENT_ID, "cmd-r", "reboot", json!({"delay_secs": "0"}));

    for expected in ["cmd-x", "cmd-r"] {
        let TickOutcome::Executed(result) = client.tick().await.unwrap() else {
            panic!("expected a failed result for {}", expected);
        };
        assert_eq!(result.command_id, expected);
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.output.as_deref(), Some("unsupported command"));
    }

    let reported: Vec<String> = mock.results().into_iter().map(|r| r.command_id).collect();
    assert_eq!(reported, vec!["cmd-x", "cmd-r"]);
}

#[tokio::test]
async fn test_forgotten_client_reregisters_in_same_tick() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let mut client = relay_client(&mock, dir.path());

    assert_eq!(client.tick().await.unwrap(), TickOutcome::Idle);
    mock.forget_client(CLIENT_ID);
    mock.push_command(CLIENT_ID, "after-reset", "ping", json!({}));

    let outcome = client.tick().await.unwrap();
    assert!(matches!(outcome, TickOutcome::Executed(ref r) if r.command_id == "after-reset"));
    assert_eq!(mock.registrations().len(), 2);
    assert!(mock.is_registered(CLIENT_ID));
    assert!(client.is_registered());
}

#[tokio::test]
async fn test_lost_result_report_replays_without_rerunning() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut client = counting_client(&mock, dir.path(), &runs);

    mock.push_command(CLIENT_ID, "once", "ping", json!({}));
    mock.fail_next_results(1);

    assert!(matches!(client.tick().await.unwrap(), TickOutcome::Executed(_)));
    assert!(mock.results().is_empty());
    assert_eq!(mock.pending_commands(CLIENT_ID), 1);

    let TickOutcome::Replayed(result) = client.tick().await.unwrap() else {
        panic!("expected the stored result to be re-reported");
    };
    assert_eq!(result.command_id, "once");
    assert_eq!(result.status, CommandStatus::Succeeded);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(mock.results().len(), 1);
    assert_eq!(mock.pending_commands(CLIENT_ID), 0);
}

#[tokio::test]
async fn test_executed_command_is_not_rerun_after_restart() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let runs = Arc::new(AtomicUsize::new(0));

    mock.push_command(CLIENT_ID, "durable", "ping", json!({}));
    mock.fail_next_results(1);
    {
        let mut client = counting_client(&mock, dir.path(), &runs);
        client.tick().await.unwrap();
    }

    let mut restarted = counting_client(&mock, dir.path(), &runs);
    assert!(matches!(restarted.tick().await.unwrap(), TickOutcome::Replayed(_)));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(mock.pending_commands(CLIENT_ID), 0);
}

#[tokio::test]
async fn test_heartbeat_reports_last_command() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let mut client = relay_client(&mock, dir.path());

    client.tick().await.unwrap();
    mock.push_command(CLIENT_ID, "hb-1", "ping", json!({}));
    client.tick().await.unwrap();
    client.heartbeat().await.unwrap();

    let heartbeats = mock.heartbeats();
    assert_eq!(heartbeats.len(), 2);
    assert_eq!(heartbeats[0]["client_id"], CLIENT_ID);
    assert_eq!(heartbeats[0]["status"], "online");
    assert!(heartbeats[0]["last_command_id"].is_null());
    assert_eq!(heartbeats[1]["last_command_id"], "hb-1");
    assert!(client.registration().last_heartbeat_at.is_some());
}

#[tokio::test]
async fn test_heartbeat_for_unknown_client() {
    init_logging();
    let mock = MockAggregator::start().await.unwrap();
    let dir = state_dir();
    let mut client = relay_client(&mock, dir.path());

    assert!(matches!(
        client.heartbeat().await,
        Err(RelayError::UnknownClient(id)) if id == CLIENT_ID
    ));
}

#[tokio::test]
async fn test_rejected_api_key() {
    init_logging();
    let mock = MockAggregator::start_with_key(Some("another-key")).await.unwrap();
    let dir = state_dir();
    let mut client = relay_client(&mock, dir.path());

    assert!(matches!(
        client.tick().await,
        Err(RelayError::Unauthorized(401))
    ));
    assert!(!client.is_registered());
}
