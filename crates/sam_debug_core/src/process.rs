use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::{DebugConfig, DebugError, Result};

/// A program plus its arguments, run without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Builds a command from whitespace separated words, `None` when empty.
    pub fn from_words(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let program = words.next()?;
        Some(Self::new(program).args(words))
    }

    /// Replaces every `{name}` placeholder in the arguments.
    pub fn substitute(&self, placeholders: &[(&str, String)]) -> Self {
        let args = self
            .args
            .iter()
            .map(|arg| {
                placeholders
                    .iter()
                    .fold(arg.clone(), |acc, (name, value)| {
                        acc.replace(&format!("{{{name}}}"), value)
                    })
            })
            .collect();
        Self {
            program: self.program.clone(),
            args,
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{part}'")
                } else {
                    part.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of one command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `command` to completion, killing it once `timeout` elapses.
    ///
    /// A timeout is reported as an output without exit code; only a failure to
    /// start the process is an error.
    async fn execute(&self, command: &CommandSpec, timeout: Duration) -> Result<ProcessOutput>;
}

/// Spawns real processes through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandExecutor;

#[async_trait]
impl CommandExecutor for TokioCommandExecutor {
    async fn execute(&self, command: &CommandSpec, wait_timeout: Duration) -> Result<ProcessOutput> {
        tracing::debug!(command = %command, "spawning process");

        let child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the pending wait on timeout kills the child.
        match timeout(wait_timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(ProcessOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                tracing::debug!(command = %command, timeout = ?wait_timeout, "process timed out");
                Ok(ProcessOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("timed out after {wait_timeout:?}"),
                })
            }
        }
    }
}

/// Re-runs a command until its output yields a value or a deadline passes.
#[derive(Clone)]
pub struct ProcessRunner {
    executor: Arc<dyn CommandExecutor>,
    poll_interval: Duration,
    attempt_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: &DebugConfig) -> Self {
        Self {
            executor,
            poll_interval: config.poll_interval,
            attempt_timeout: config.attempt_timeout,
        }
    }

    /// Polls `command` until `extract` returns a value.
    ///
    /// Each attempt is bounded by the remaining time. Fails with
    /// [`DebugError::ProcessDiscoveryTimeout`] carrying the last attempt's
    /// output once `deadline` has elapsed, or with [`DebugError::Cancelled`]
    /// as soon as `cancel` fires.
    pub async fn run_until<T, F>(
        &self,
        deadline: Duration,
        command: &CommandSpec,
        cancel: &CancellationToken,
        mut extract: F,
    ) -> Result<T>
    where
        F: FnMut(&ProcessOutput) -> Option<T>,
    {
        let started = Instant::now();
        let mut last = ProcessOutput::default();
        let mut attempts = 0_u32;

        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }

            attempts += 1;
            let output = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DebugError::Cancelled),
                output = self.executor.execute(command, self.attempt_timeout.min(remaining)) => output?,
            };

            if let Some(value) = extract(&output) {
                tracing::debug!(command = %command, attempts, "poll succeeded");
                return Ok(value);
            }
            last = output;

            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DebugError::Cancelled),
                _ = sleep(self.poll_interval.min(remaining)) => {}
            }
        }

        tracing::warn!(command = %command, attempts, "poll deadline elapsed");
        Err(DebugError::ProcessDiscoveryTimeout {
            command: command.command_line(),
            elapsed: started.elapsed(),
            exit_code: last.exit_code,
            stdout: last.stdout,
            stderr: last.stderr,
        })
    }
}
