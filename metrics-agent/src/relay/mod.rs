//! Outbound-only command relay
//!
//! The agent never listens; the server queues commands and the agent polls:
//! - `register` upserts this client (once per session)
//! - `heartbeat` reports liveness on its own interval
//! - `poll` fetches at most one pending command
//! - `execute` + `report_result` run it and send back the outcome
//!
//! A 404 on a client-scoped endpoint means the server forgot us: the relay
//! drops back to unregistered and re-registers within the same tick.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{RelayConfig, ServerConfig};
use crate::delivery::http_client;
use crate::error::RelayError;
use crate::execution::CommandExecutor;
use crate::models::{
    ClientRegistration, Command, CommandResult, HeartbeatRequest, RegistrationRequest,
};

pub mod state;

pub use state::RegistrationStore;

pub const CLIENT_TYPE: &str = "metrics_client";

/// What one relay tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing pending
    Idle,
    /// A new command ran
    Executed(CommandResult),
    /// The server re-delivered the last command; its stored result was re-reported
    Replayed(CommandResult),
}

pub struct CommandRelayClient {
    http: reqwest::Client,
    base_url: String,
    hostname: String,
    executor: CommandExecutor,
    store: RegistrationStore,
    registration: ClientRegistration,
    registered: bool,
    heartbeat_interval: Duration,
    last_heartbeat: Option<Instant>,
}

impl CommandRelayClient {
    pub fn new(
        server: &ServerConfig,
        relay: &RelayConfig,
        client_id: &str,
        hostname: &str,
        executor: CommandExecutor,
    ) -> Result<Self> {
        let store = RegistrationStore::new(relay.state_file());
        let registration = store
            .load(client_id)
            .with_context(|| format!("Failed to load relay state {}", store.path().display()))?;

        Ok(Self {
            http: http_client(server, client_id)?,
            base_url: server.base_url().to_string(),
            hostname: hostname.to_string(),
            executor,
            store,
            registration,
            registered: false,
            heartbeat_interval: relay.heartbeat_interval(),
            last_heartbeat: None,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.registration.client_id
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn registration(&self) -> &ClientRegistration {
        &self.registration
    }

    fn client_url(&self, suffix: &str) -> String {
        format!("{}/clients/{}{}", self.base_url, self.registration.client_id, suffix)
    }

    /// Upsert this client on the server; no-op once registered in this session
    pub async fn register(&mut self) -> Result<(), RelayError> {
        if self.registered {
            debug!("Already registered as {}", self.client_id());
            return Ok(());
        }

        let body = RegistrationRequest {
            client_id: &self.registration.client_id,
            hostname: &self.hostname,
            client_type: CLIENT_TYPE,
            os: std::env::consts::OS,
            version: env!("CARGO_PKG_VERSION"),
            timestamp: Utc::now(),
        };
        let url = format!("{}/clients/register", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;
        check_status(response, None).await?;

        self.registered = true;
        self.registration.registered_at = Some(Utc::now());
        self.persist();
        info!("Registered with command server as {}", self.client_id());
        Ok(())
    }

    /// Fetch the next pending command, if any
    pub async fn poll(&self) -> Result<Option<Command>, RelayError> {
        let response = self
            .http
            .get(self.client_url("/commands/next"))
            .send()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = check_status(response, Some(self.client_id())).await?;
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;
        parse_poll_body(&body)
    }

    pub async fn execute(&self, command: &Command) -> CommandResult {
        self.executor.execute(command).await
    }

    pub async fn report_result(&self, result: &CommandResult) -> Result<(), RelayError> {
        let url = self.client_url(&format!("/commands/{}/result", result.command_id));
        let response = self
            .http
            .post(&url)
            .json(result)
            .send()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;
        check_status(response, None).await?;
        debug!("Reported result of command {}", result.command_id);
        Ok(())
    }

    pub async fn heartbeat(&mut self) -> Result<(), RelayError> {
        let body = HeartbeatRequest {
            client_id: &self.registration.client_id,
            status: "online",
            last_command_id: self.registration.last_command_id.as_deref(),
            timestamp: Utc::now(),
        };
        let response = self
            .http
            .post(self.client_url("/heartbeat"))
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;
        check_status(response, Some(self.client_id())).await?;

        self.last_heartbeat = Some(Instant::now());
        self.registration.last_heartbeat_at = Some(Utc::now());
        self.persist();
        Ok(())
    }

    /// Forget the session registration; the next `register` talks to the server again
    pub fn soft_reset(&mut self) {
        warn!("Command server does not know client {}, re-registering", self.client_id());
        self.registered = false;
        self.last_heartbeat = None;
    }

    fn heartbeat_due(&self) -> bool {
        self.last_heartbeat
            .map_or(true, |at| at.elapsed() >= self.heartbeat_interval)
    }

    /// One relay cycle: register, heartbeat when due, poll, execute, record, report
    pub async fn tick(&mut self) -> Result<TickOutcome, RelayError> {
        self.register().await?;

        if self.heartbeat_due() {
            match self.heartbeat().await {
                Ok(()) => {}
                Err(RelayError::UnknownClient(_)) => {
                    self.soft_reset();
                    self.register().await?;
                }
                Err(e) => log_relay_error(&e, "Heartbeat failed"),
            }
        }

        let command = match self.poll().await {
            Err(RelayError::UnknownClient(_)) => {
                self.soft_reset();
                self.register().await?;
                self.poll().await?
            }
            other => other?,
        };
        let Some(command) = command else {
            debug!("No pending command");
            return Ok(TickOutcome::Idle);
        };

        if self.registration.last_command_id.as_deref() == Some(command.id.as_str()) {
            let result = match &self.registration.last_result {
                Some(result) if result.command_id == command.id => result.clone(),
                _ => CommandResult::failed(&command.id, "command already executed"),
            };
            info!("Command {} was already executed, re-reporting its result", command.id);
            if let Err(e) = self.report_result(&result).await {
                log_relay_error(&e, "Result report failed");
            }
            return Ok(TickOutcome::Replayed(result));
        }

        let result = self.execute(&command).await;

        // recorded before reporting: a crash in between must not run the command again
        self.registration.last_command_id = Some(command.id.clone());
        self.registration.last_result = Some(result.clone());
        self.persist();

        if let Err(e) = self.report_result(&result).await {
            log_relay_error(&e, "Result report failed, dropping it");
        }
        Ok(TickOutcome::Executed(result))
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.registration) {
            error!("Failed to save relay state: {}", e);
        }
    }
}

/// Map a response status onto the relay error taxonomy.
///
/// `client` is set for client-scoped endpoints, where 404 means "unknown client".
async fn check_status(response: Response, client: Option<&str>) -> Result<Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(RelayError::Unauthorized(status.as_u16()));
    }
    if status == StatusCode::NOT_FOUND {
        if let Some(client) = client {
            return Err(RelayError::UnknownClient(client.to_string()));
        }
    }
    let body = response.text().await.unwrap_or_default();
    Err(RelayError::Server {
        status: status.as_u16(),
        body,
    })
}

/// Accepts an empty body, `null`, `{"command": null}`, a bare command or `{"command": {...}}`
fn parse_poll_body(body: &str) -> Result<Option<Command>, RelayError> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let value: Value =
        serde_json::from_str(body).map_err(|e| RelayError::InvalidResponse(e.to_string()))?;

    let command = match value {
        Value::Null => return Ok(None),
        Value::Object(mut map) if map.contains_key("command") => match map.remove("command") {
            None | Some(Value::Null) => return Ok(None),
            Some(inner) => inner,
        },
        other => other,
    };

    serde_json::from_value(command)
        .map(Some)
        .map_err(|e| RelayError::InvalidResponse(format!("malformed command: {}", e)))
}

pub(crate) fn log_relay_error(error: &RelayError, context: &str) {
    match error {
        RelayError::Unauthorized(status) => {
            error!("{}: server rejected API key (HTTP {})", context, status)
        }
        RelayError::State(e) => error!("{}: {}", context, e),
        other => warn!("{}: {}", context, other),
    }
}
