use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{DEBUG_PORTS, HOST_PROCESS};
use crate::context::AttributeContext;
use crate::host::{ChildHostProcess, HostProcess};
use crate::pipeline::{MessageEmitter, Step};
use crate::process::CommandSpec;
use crate::Result;

/// Starts the long-running host, typically `sam local invoke --debug-port`.
///
/// `{frontend}` and `{backend}` in the arguments are replaced with the
/// allocated debugger ports. The process keeps running after the step; its
/// output goes to the log.
pub struct LaunchHostProcessStep {
    command: CommandSpec,
}

impl LaunchHostProcessStep {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Step for LaunchHostProcessStep {
    fn name(&self) -> &str {
        "Start SAM application"
    }

    async fn execute(
        &self,
        context: &mut AttributeContext,
        emitter: &dyn MessageEmitter,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let ports = *context.get_required_attribute(&DEBUG_PORTS)?;
        let command = self.command.substitute(&[
            ("frontend", ports.frontend().to_string()),
            ("backend", ports.backend().to_string()),
        ]);
        emitter.emit(&command.command_line(), false);

        let host: Arc<dyn HostProcess> = Arc::new(ChildHostProcess::spawn(&command)?);
        context.put_attribute(&HOST_PROCESS, host)
    }
}
