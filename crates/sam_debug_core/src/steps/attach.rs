use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CONTAINER_ID, DEBUG_PORTS, DEBUG_SESSION, HOST_PROCESS, TARGET_PID};
use crate::bridge::{AttachRequest, DebuggerBridge};
use crate::context::AttributeContext;
use crate::pipeline::{MessageEmitter, Step};
use crate::Result;

/// Attaches the debugger worker to the discovered runtime process.
pub struct AttachDebuggerStep {
    bridge: DebuggerBridge,
    host: String,
}

impl AttachDebuggerStep {
    pub fn new(bridge: DebuggerBridge, host: impl Into<String>) -> Self {
        Self {
            bridge,
            host: host.into(),
        }
    }
}

#[async_trait]
impl Step for AttachDebuggerStep {
    fn name(&self) -> &str {
        "Attach debugger"
    }

    async fn execute(
        &self,
        context: &mut AttributeContext,
        emitter: &dyn MessageEmitter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = AttachRequest {
            host: self.host.clone(),
            ports: *context.get_required_attribute(&DEBUG_PORTS)?,
            container_id: context.get_required_attribute(&CONTAINER_ID)?.clone(),
            pid: *context.get_required_attribute(&TARGET_PID)?,
        };
        let host_process = context.get_required_attribute(&HOST_PROCESS)?.clone();

        let session = self.bridge.attach(&request, host_process, cancel).await?;
        emitter.emit(
            &format!(
                "Debugger attached to process {} in container {}",
                request.pid, request.container_id
            ),
            false,
        );
        context.put_attribute(&DEBUG_SESSION, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::{FakeHost, FakeLauncher, FakeWorker};
    use crate::host::HostProcess;
    use crate::pipeline::tests::RecordingEmitter;
    use crate::ports::DebugPorts;
    use crate::session::SessionEnd;
    use crate::{DebugConfig, DebugError};
    use std::sync::Arc;
    use std::time::Duration;

    fn context(ports: DebugPorts, host: Arc<FakeHost>) -> AttributeContext {
        let mut context = AttributeContext::default();
        context.put_attribute(&DEBUG_PORTS, ports).unwrap();
        context.put_attribute(&CONTAINER_ID, "c1".to_string()).unwrap();
        context.put_attribute(&TARGET_PID, 4242).unwrap();
        let host: Arc<dyn HostProcess> = host;
        context.put_attribute(&HOST_PROCESS, host).unwrap();
        context
    }

    fn step(launcher: Arc<FakeLauncher>) -> AttachDebuggerStep {
        let config = DebugConfig::new("127.0.0.1", Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(10));
        AttachDebuggerStep::new(DebuggerBridge::new(launcher, config), "127.0.0.1")
    }

    #[tokio::test]
    async fn test_publishes_session() {
        let worker = FakeWorker::start(true).await;
        let launcher = Arc::new(FakeLauncher::default());
        let mut context = context(worker.ports, FakeHost::new());
        let emitter = RecordingEmitter::default();

        step(launcher.clone())
            .execute(&mut context, &emitter, &CancellationToken::new())
            .await
            .unwrap();

        let session = context.get_required_attribute(&DEBUG_SESSION).unwrap();
        assert_eq!(session.pid(), 4242);
        assert_eq!(
            emitter.events(),
            vec!["out:Debugger attached to process 4242 in container c1"]
        );
        assert!(session.close().await);
        assert_eq!(session.end_reason(), Some(SessionEnd::Closed));
        assert_eq!(launcher.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn test_requires_discovered_pid() {
        let mut context = AttributeContext::default();
        context.put_attribute(&DEBUG_PORTS, DebugPorts::new(1, 2)).unwrap();
        context.put_attribute(&CONTAINER_ID, "c1".to_string()).unwrap();
        let launcher = Arc::new(FakeLauncher::default());

        let err = step(launcher.clone())
            .execute(&mut context, &RecordingEmitter::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DebugError::MissingAttribute("target_pid")));
        assert!(launcher.launches.lock().unwrap().is_empty());
    }
}
