//! Command execution for the relay
//!
//! Handles whitelisted commands only:
//! - Dispatch by `CommandType` to a registered `CommandHandler`
//! - Execution timeout (child processes are killed when it fires)
//! - Every outcome, including unknown types and handler panics, becomes a `CommandResult`

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::models::{Command, CommandResult, CommandType};

pub mod handlers;

pub use handlers::{KillProcessHandler, PingHandler, PowerAction, PowerHandler, ShutdownWslHandler};

#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command; the returned string becomes the result output
    async fn handle(&self, args: &HashMap<String, String>) -> Result<String, ExecutionError>;
}

pub struct CommandExecutor {
    handlers: HashMap<CommandType, Arc<dyn CommandHandler>>,
    timeout: Duration,
}

impl CommandExecutor {
    /// Executor with no handlers: every command fails as unsupported
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout,
        }
    }

    /// Executor with the built-in handler of every enabled type
    pub fn with_builtins(enabled: &[CommandType], timeout: Duration) -> Self {
        let mut executor = Self::new(timeout);
        for command_type in enabled {
            let handler: Arc<dyn CommandHandler> = match command_type {
                CommandType::Ping => Arc::new(PingHandler),
                CommandType::ShutdownWsl => Arc::new(ShutdownWslHandler),
                CommandType::Shutdown => Arc::new(PowerHandler::new(PowerAction::Shutdown)),
                CommandType::Reboot => Arc::new(PowerHandler::new(PowerAction::Reboot)),
                CommandType::KillProcess => Arc::new(KillProcessHandler),
                CommandType::Unsupported(_) => continue,
            };
            executor.handlers.insert(command_type.clone(), handler);
        }
        executor
    }

    /// Install or replace the handler of a whitelisted type
    pub fn register(
        &mut self,
        command_type: CommandType,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), ExecutionError> {
        if !command_type.is_supported() {
            return Err(ExecutionError::Unsupported);
        }
        if self.handlers.insert(command_type.clone(), handler).is_some() {
            debug!("Replaced handler for {}", command_type);
        }
        Ok(())
    }

    pub fn supports(&self, command_type: &CommandType) -> bool {
        self.handlers.contains_key(command_type)
    }

    pub fn enabled_types(&self) -> Vec<CommandType> {
        CommandType::KNOWN
            .into_iter()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    /// Never fails: errors, timeouts and panics are reported as `failed` results
    pub async fn execute(&self, command: &Command) -> CommandResult {
        let Some(handler) = self.handlers.get(&command.command_type).cloned() else {
            warn!(
                "Rejecting command {} of unsupported type '{}'",
                command.id, command.command_type
            );
            return CommandResult::failed(&command.id, ExecutionError::Unsupported.to_string());
        };

        info!("Executing command {} ({})", command.id, command.command_type);
        let start = Instant::now();
        let args = command.args.clone();
        let mut task = tokio::spawn(async move { handler.handle(&args).await });

        let outcome = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ExecutionError::Failed(format!("handler panicked: {}", join_error))),
            Err(_) => {
                // dropping the handler future kills any child it spawned
                task.abort();
                Err(ExecutionError::Timeout(self.timeout.as_secs()))
            }
        };

        match outcome {
            Ok(output) => {
                info!(
                    "Command {} succeeded in {}ms",
                    command.id,
                    start.elapsed().as_millis()
                );
                CommandResult::succeeded(&command.id, output)
            }
            Err(e) => {
                warn!("Command {} failed: {}", command.id, e);
                CommandResult::failed(&command.id, e.to_string())
            }
        }
    }
}
