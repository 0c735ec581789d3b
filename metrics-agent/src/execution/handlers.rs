//! Built-in command handlers
//!
//! Arguments are parsed into typed values before anything runs, and programs are
//! started directly with discrete argv entries (no shell).

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use super::CommandHandler;
use crate::error::ExecutionError;

/// Upper bound for `delay_secs` (one day)
pub const MAX_DELAY_SECS: u32 = 86_400;

/// `delay_secs`, optional, defaults to 0
pub fn parse_delay(args: &HashMap<String, String>) -> Result<u32, ExecutionError> {
    let Some(raw) = args.get("delay_secs") else {
        return Ok(0);
    };
    let delay: u32 = raw
        .trim()
        .parse()
        .map_err(|_| ExecutionError::invalid("delay_secs", format!("'{}' is not a non-negative integer", raw)))?;
    if delay > MAX_DELAY_SECS {
        return Err(ExecutionError::invalid(
            "delay_secs",
            format!("{} exceeds the {}s maximum", delay, MAX_DELAY_SECS),
        ));
    }
    Ok(delay)
}

/// `pid`, required; never init and never this agent
pub fn parse_pid(args: &HashMap<String, String>) -> Result<u32, ExecutionError> {
    let raw = args
        .get("pid")
        .ok_or_else(|| ExecutionError::invalid("pid", "missing"))?;
    let pid: u32 = raw
        .trim()
        .parse()
        .map_err(|_| ExecutionError::invalid("pid", format!("'{}' is not a process id", raw)))?;
    if pid <= 1 {
        return Err(ExecutionError::invalid("pid", format!("refusing to signal pid {}", pid)));
    }
    if pid == std::process::id() {
        return Err(ExecutionError::invalid("pid", "refusing to kill the agent itself"));
    }
    Ok(pid)
}

/// Run a program to completion; non-zero exit is a failure carrying stderr
async fn run_program(program: &str, args: &[String]) -> Result<String, ExecutionError> {
    debug!("Running {} {:?}", program, args);
    let output = AsyncCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ExecutionError::Failed(format!("failed to start {}: {}", program, e)))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(ExecutionError::Failed(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

pub struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, _args: &HashMap<String, String>) -> Result<String, ExecutionError> {
        Ok("pong".to_string())
    }
}

/// Shuts down the WSL VM from inside a WSL distribution
pub struct ShutdownWslHandler;

#[async_trait]
impl CommandHandler for ShutdownWslHandler {
    async fn handle(&self, _args: &HashMap<String, String>) -> Result<String, ExecutionError> {
        info!("Executing WSL shutdown");
        run_program("wsl.exe", &["--shutdown".to_string()]).await?;
        Ok("WSL shutdown successful".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Shutdown,
    Reboot,
}

pub struct PowerHandler {
    action: PowerAction,
}

impl PowerHandler {
    pub fn new(action: PowerAction) -> Self {
        Self { action }
    }

    /// Program and argv for the current platform
    fn invocation(&self, delay_secs: u32) -> Result<(&'static str, Vec<String>), ExecutionError> {
        if cfg!(target_os = "windows") {
            let flag = match self.action {
                PowerAction::Shutdown => "/s",
                PowerAction::Reboot => "/r",
            };
            Ok(("shutdown", vec![flag.to_string(), "/t".to_string(), delay_secs.to_string()]))
        } else if cfg!(unix) {
            let flag = match self.action {
                PowerAction::Shutdown => "-h",
                PowerAction::Reboot => "-r",
            };
            // shutdown(8) schedules in whole minutes
            let when = if delay_secs == 0 {
                "now".to_string()
            } else {
                format!("+{}", delay_secs.div_ceil(60))
            };
            Ok(("shutdown", vec![flag.to_string(), when]))
        } else {
            Err(ExecutionError::PlatformUnsupported)
        }
    }
}

#[async_trait]
impl CommandHandler for PowerHandler {
    async fn handle(&self, args: &HashMap<String, String>) -> Result<String, ExecutionError> {
        let delay = parse_delay(args)?;
        let (program, argv) = self.invocation(delay)?;
        info!("Executing power command {:?} (delay: {}s)", self.action, delay);
        run_program(program, &argv).await?;

        let verb = match self.action {
            PowerAction::Shutdown => "Shutdown",
            PowerAction::Reboot => "Reboot",
        };
        Ok(format!("{} scheduled in {} seconds", verb, delay))
    }
}

pub struct KillProcessHandler;

#[async_trait]
impl CommandHandler for KillProcessHandler {
    async fn handle(&self, args: &HashMap<String, String>) -> Result<String, ExecutionError> {
        let pid = parse_pid(args)?;
        info!("Killing process PID: {}", pid);

        if cfg!(target_os = "windows") {
            run_program("taskkill", &["/PID".to_string(), pid.to_string(), "/F".to_string()]).await?;
        } else if cfg!(unix) {
            run_program("kill", &["-TERM".to_string(), pid.to_string()]).await?;
        } else {
            return Err(ExecutionError::PlatformUnsupported);
        }
        Ok(format!("Process {} killed successfully", pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay(&args(&[])).unwrap(), 0);
        assert_eq!(parse_delay(&args(&[("delay_secs", "90")])).unwrap(), 90);
        assert!(parse_delay(&args(&[("delay_secs", "86401")])).is_err());
        assert!(parse_delay(&args(&[("delay_secs", "-1")])).is_err());
        assert!(parse_delay(&args(&[("delay_secs", "5 && reboot")])).is_err());
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid(&args(&[("pid", "4242")])).unwrap(), 4242);
        assert!(parse_pid(&args(&[])).is_err());
        assert!(parse_pid(&args(&[("pid", "1")])).is_err());
        assert!(parse_pid(&args(&[("pid", std::process::id().to_string().as_str())])).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_power_invocation() {
        let shutdown = PowerHandler::new(PowerAction::Shutdown);
        let (program, argv) = shutdown.invocation(0).unwrap();
        assert_eq!(program, "shutdown");
        assert_eq!(argv, vec!["-h", "now"]);

        let reboot = PowerHandler::new(PowerAction::Reboot);
        let (_, argv) = reboot.invocation(61).unwrap();
        assert_eq!(argv, vec!["-r", "+2"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_process_terminates_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let output = KillProcessHandler
            .handle(&args(&[("pid", pid.to_string().as_str())]))
            .await
            .unwrap();
        assert!(output.contains(&pid.to_string()));

        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_program_reports_failure() {
        let err = run_program("false", &[]).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Failed(_)));
    }
}
