use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::process::CommandSpec;
use crate::Result;

/// The long-running process that hosts the emulated function, usually
/// `sam local invoke` or `sam local start-api`.
#[async_trait]
pub trait HostProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Resolves with the exit code once the process has terminated.
    async fn wait_exit(&self) -> Option<i32>;

    async fn terminate(&self);
}

/// Exit state published by the monitor task: `None` while running.
type ExitState = Option<Option<i32>>;

/// A spawned child process watched by a background task.
pub struct ChildHostProcess {
    pid: Option<u32>,
    exit: watch::Receiver<ExitState>,
    kill: CancellationToken,
}

impl ChildHostProcess {
    /// Spawns `command` and forwards its output lines to the log.
    pub fn spawn(command: &CommandSpec) -> Result<Self> {
        let mut child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "host", false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "host", true));
        }

        tracing::info!(command = %command, pid = ?child.id(), "started host process");
        Ok(Self::monitor(child))
    }

    /// Takes ownership of an already spawned child.
    pub fn monitor(mut child: Child) -> Self {
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let kill_requested = kill.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_requested.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code());
            tracing::info!(pid = ?pid, exit_code = ?code, "host process exited");
            exit_tx.send_replace(Some(code));
        });

        Self {
            pid,
            exit: exit_rx,
            kill,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[async_trait]
impl HostProcess for ChildHostProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait_exit(&self) -> Option<i32> {
        let mut exit = self.exit.clone();
        let state = exit.wait_for(Option::is_some).await.map(|state| *state);
        state.ok().flatten().flatten()
    }

    async fn terminate(&self) {
        self.kill.cancel();
        self.wait_exit().await;
    }
}

/// Logs every line a child process writes until the stream closes.
pub(crate) async fn forward_lines<R>(stream: R, process: &'static str, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            tracing::warn!(target: "child_output", process, "{}", line);
        } else {
            tracing::info!(target: "child_output", process, "{}", line);
        }
    }
}
