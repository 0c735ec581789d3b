//! Wire and storage data model shared by delivery and the command relay
//!
//! Everything here is plain data:
//! - Metric entries and batches (what collectors produce and the server ingests)
//! - Buffer records (what the delivery client persists while offline)
//! - Commands, results and the client registration (relay protocol)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// One measurement (matches the `/metrics` entry schema)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl MetricEntry {
    /// New entry stamped with the current time
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            unit: None,
            description: None,
            metadata: HashMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = at;
        self
    }

    /// JSON has no NaN/Infinity, and an unnamed entry cannot be upserted server-side
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("entry has an empty name".to_string());
        }
        if !self.value.is_finite() {
            return Err(format!("entry '{}' has non-finite value {}", self.name, self.value));
        }
        Ok(())
    }
}

/// Identity of the emitting host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

/// All entries of one collection round, sent as one logical unit.
///
/// Fields are private: a batch cannot change after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBatch {
    source: Source,
    metrics: Vec<MetricEntry>,
}

impl MetricBatch {
    pub fn new(source: Source, metrics: Vec<MetricEntry>) -> Self {
        Self { source, metrics }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn entries(&self) -> &[MetricEntry] {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Checks every entry can be represented on the wire
    pub fn validate(&self) -> Result<(), String> {
        for (index, entry) in self.metrics.iter().enumerate() {
            entry
                .validate()
                .map_err(|reason| format!("#{}: {}", index, reason))?;
        }
        Ok(())
    }
}

/// Body of `POST /metrics` and `POST /metrics/bulk`
#[derive(Debug, Serialize)]
pub struct MetricsPayload<'a> {
    pub source: &'a Source,
    pub metrics: Vec<&'a MetricEntry>,
}

impl<'a> MetricsPayload<'a> {
    pub fn single(batch: &'a MetricBatch) -> Self {
        Self {
            source: batch.source(),
            metrics: batch.entries().iter().collect(),
        }
    }

    /// Concatenates the entries of consecutive records sharing one source, keeping record order.
    ///
    /// `None` for an empty slice or when any record would not pass `validate`.
    pub fn coalesced(records: &'a [BufferRecord]) -> Option<Self> {
        let first = records.first()?;
        if records.iter().any(|record| record.batch.validate().is_err()) {
            return None;
        }
        let metrics = records
            .iter()
            .flat_map(|record| record.batch.entries().iter())
            .collect();
        Some(Self {
            source: first.batch.source(),
            metrics,
        })
    }
}

/// A batch waiting in the persistent buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferRecord {
    pub id: Uuid,
    pub batch: MetricBatch,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl BufferRecord {
    pub fn new(batch: MetricBatch) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch,
            enqueued_at: Utc::now(),
            attempt_count: 0,
        }
    }
}

/// Whitelisted command types.
///
/// Anything the server sends outside this set lands in `Unsupported` so that a
/// single unknown instruction never breaks polling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandType {
    Ping,
    ShutdownWsl,
    Shutdown,
    Reboot,
    KillProcess,
    Unsupported(String),
}

impl CommandType {
    /// Every type the executor knows how to run
    pub const KNOWN: [CommandType; 5] = [
        CommandType::Ping,
        CommandType::ShutdownWsl,
        CommandType::Shutdown,
        CommandType::Reboot,
        CommandType::KillProcess,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            CommandType::Ping => "ping",
            CommandType::ShutdownWsl => "shutdown_wsl",
            CommandType::Shutdown => "shutdown",
            CommandType::Reboot => "reboot",
            CommandType::KillProcess => "kill_process",
            CommandType::Unsupported(name) => name,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, CommandType::Unsupported(_))
    }
}

impl From<String> for CommandType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ping" => CommandType::Ping,
            "shutdown_wsl" => CommandType::ShutdownWsl,
            "shutdown" => CommandType::Shutdown,
            "reboot" => CommandType::Reboot,
            "kill_process" => CommandType::KillProcess,
            _ => CommandType::Unsupported(value),
        }
    }
}

impl From<&str> for CommandType {
    fn from(value: &str) -> Self {
        CommandType::from(value.to_string())
    }
}

impl From<CommandType> for String {
    fn from(value: CommandType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command fetched from `GET /clients/{id}/commands/next`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub args: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Succeeded,
    Failed,
}

/// Outcome reported to `POST /clients/{id}/commands/{cmd_id}/result`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub output: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn succeeded(command_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: CommandStatus::Succeeded,
            output: Some(output.into()),
            completed_at: Utc::now(),
        }
    }

    pub fn failed(command_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: CommandStatus::Failed,
            output: Some(output.into()),
            completed_at: Utc::now(),
        }
    }
}

/// Relay client identity and bookkeeping, persisted between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_command_id: Option<String>,
    #[serde(default)]
    pub last_result: Option<CommandResult>,
}

impl ClientRegistration {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            registered_at: None,
            last_heartbeat_at: None,
            last_command_id: None,
            last_result: None,
        }
    }
}

/// Body of `POST /clients/register`
#[derive(Debug, Serialize)]
pub struct RegistrationRequest<'a> {
    pub client_id: &'a str,
    pub hostname: &'a str,
    pub client_type: &'static str,
    pub os: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /clients/{id}/heartbeat`
#[derive(Debug, Serialize)]
pub struct HeartbeatRequest<'a> {
    pub client_id: &'a str,
    pub status: &'static str,
    pub last_command_id: Option<&'a str>,
    pub timestamp: DateTime<Utc>,
}
