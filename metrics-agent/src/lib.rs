//! Metrics Agent - host metrics delivery with a polling command relay
//!
//! - Periodic collection through pluggable `Collector`s
//! - At-least-once HTTP delivery backed by a durable on-disk buffer
//! - Outbound-only command relay (register, heartbeat, poll, execute, report)

pub mod agent;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod delivery;
pub mod error;
pub mod execution;
pub mod identity;
pub mod manager;
pub mod models;
pub mod relay;

pub use agent::{Agent, ShutdownHandle};
pub use config::AgentConfig;
pub use delivery::{DeliveryClient, DeliveryOutcome, FlushReport};
pub use manager::{CollectionReport, MetricsManager};
pub use relay::{CommandRelayClient, TickOutcome};
