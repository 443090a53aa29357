use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::AttributeContext;
use crate::pipeline::{MessageEmitter, Step};
use crate::process::{CommandExecutor, CommandSpec};
use crate::{DebugError, Result};

/// Runs a command to completion and forwards its output, e.g. `sam build`.
pub struct RunCommandStep {
    name: String,
    command: CommandSpec,
    executor: Arc<dyn CommandExecutor>,
    timeout: Duration,
}

impl RunCommandStep {
    pub fn new(
        name: impl Into<String>,
        command: CommandSpec,
        executor: Arc<dyn CommandExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            executor,
            timeout,
        }
    }
}

#[async_trait]
impl Step for RunCommandStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _context: &mut AttributeContext,
        emitter: &dyn MessageEmitter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        emitter.emit(&self.command.command_line(), false);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DebugError::Cancelled),
            output = self.executor.execute(&self.command, self.timeout) => output?,
        };

        for line in output.stdout.lines() {
            emitter.emit(line, false);
        }
        for line in output.stderr.lines() {
            emitter.emit(line, true);
        }

        if output.success() {
            Ok(())
        } else {
            Err(DebugError::CommandFailed {
                command: self.command.command_line(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }
}
