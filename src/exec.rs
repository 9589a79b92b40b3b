//! External command execution
//!
//! Every process restart and CLI invocation goes through [`CommandRunner`]
//! so coordinators can be exercised without touching the host.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{Error, Result};

/// Executes external commands
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command, succeeding only on exit code 0
    async fn run(&self, command: &[String]) -> Result<()>;

    /// Run a command and capture its standard output
    async fn output(&self, command: &[String]) -> Result<String>;
}

/// Runs commands on the host
///
/// Children are killed when the returned future is dropped, so a request
/// deadline also bounds any command it started.
#[derive(Clone, Debug, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    fn command(command: &[String]) -> Result<Command> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::validation("run command", "empty command line"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, command: &[String]) -> Result<()> {
        debug!(command = ?command, "Executing command");
        let status = Self::command(command)?
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                Error::external_command(format!("run {}", command.join(" ")), e.to_string())
            })?;

        if !status.success() {
            return Err(Error::external_command(
                format!("run {}", command.join(" ")),
                format!("exited with {status}"),
            ));
        }
        Ok(())
    }

    async fn output(&self, command: &[String]) -> Result<String> {
        debug!(command = ?command, "Executing command for output");
        let output = Self::command(command)?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                Error::external_command(format!("run {}", command.join(" ")), e.to_string())
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::external_command(
                format!("run {}", command.join(" ")),
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Most recent commands kept by [`RecordingCommandRunner`]
pub const RECORDED_CALLS_LIMIT: usize = 1024;

/// Records commands instead of running them
///
/// Used by development mode and by tests that assert on the exact sequence
/// of restarts and tool invocations. Only the latest
/// [`RECORDED_CALLS_LIMIT`] commands are kept; every command is logged.
#[derive(Debug, Default)]
pub struct RecordingCommandRunner {
    calls: Mutex<VecDeque<String>>,
    outputs: HashMap<String, String>,
    fail_on: Option<String>,
}

impl RecordingCommandRunner {
    /// Create a runner that succeeds for every command
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `stdout` for the command whose joined form starts with `prefix`
    pub fn with_output(mut self, prefix: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.outputs.insert(prefix.into(), stdout.into());
        self
    }

    /// Fail every command whose joined form starts with `prefix`
    pub fn failing_on(mut self, prefix: impl Into<String>) -> Self {
        self.fail_on = Some(prefix.into());
        self
    }

    /// Commands executed so far, each joined with single spaces
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, command: &[String]) -> Result<String> {
        let joined = command.join(" ");
        info!(command = %joined, "Recording command");
        if let Ok(mut calls) = self.calls.lock() {
            if calls.len() == RECORDED_CALLS_LIMIT {
                calls.pop_front();
            }
            calls.push_back(joined.clone());
        }
        match &self.fail_on {
            Some(prefix) if joined.starts_with(prefix.as_str()) => Err(Error::external_command(
                format!("run {joined}"),
                "exited with exit status: 1",
            )),
            _ => Ok(joined),
        }
    }
}

#[async_trait]
impl CommandRunner for RecordingCommandRunner {
    async fn run(&self, command: &[String]) -> Result<()> {
        self.record(command).map(|_| ())
    }

    async fn output(&self, command: &[String]) -> Result<String> {
        let joined = self.record(command)?;
        Ok(self
            .outputs
            .iter()
            .find(|(prefix, _)| joined.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}

/// Build an owned command line from string-like parts
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_runner_reports_exit_status() {
        let runner = SystemCommandRunner;
        assert!(runner.run(&argv(["true"])).await.is_ok());

        let err = runner.run(&argv(["false"])).await.unwrap_err();
        assert!(matches!(err, Error::ExternalCommand { .. }));
        assert!(err.to_string().contains("run false"));
    }

    #[tokio::test]
    async fn system_runner_captures_stdout() {
        let out = SystemCommandRunner
            .output(&argv(["echo", "hello"]))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn empty_command_line_is_rejected() {
        let err = SystemCommandRunner.run(&[]).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn recording_runner_keeps_call_order() {
        let runner = RecordingCommandRunner::new().with_output("kubectl get", "{}");

        runner.run(&argv(["snapctl", "restart", "x"])).await.unwrap();
        let out = runner.output(&argv(["kubectl", "get", "nodes"])).await.unwrap();

        assert_eq!(out, "{}");
        assert_eq!(runner.calls(), vec!["snapctl restart x", "kubectl get nodes"]);
    }

    #[tokio::test]
    async fn recording_runner_keeps_only_latest_calls() {
        let runner = RecordingCommandRunner::new();
        for i in 0..RECORDED_CALLS_LIMIT + 5 {
            runner.run(&argv(["cmd".to_string(), i.to_string()])).await.unwrap();
        }

        let calls = runner.calls();
        assert_eq!(calls.len(), RECORDED_CALLS_LIMIT);
        assert_eq!(calls[0], "cmd 5");
        assert_eq!(calls.last().unwrap(), &format!("cmd {}", RECORDED_CALLS_LIMIT + 4));
    }

    #[tokio::test]
    async fn recording_runner_can_fail_selected_commands() {
        let runner = RecordingCommandRunner::new().failing_on("snapctl");

        assert!(runner.run(&argv(["kubectl", "apply"])).await.is_ok());
        let err = runner.run(&argv(["snapctl", "restart"])).await.unwrap_err();
        assert!(matches!(err, Error::ExternalCommand { .. }));
        assert_eq!(runner.calls().len(), 2);
    }
}
