use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::host::HostProcess;
use crate::ports::DebugPorts;
use crate::rpc::{RpcConnection, TargetSignal};
use crate::types::DISCONNECT_COMMAND;

type TeardownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TeardownAction = Box<dyn FnOnce() -> TeardownFuture + Send>;

/// Why a debug session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The host process (SAM CLI) terminated.
    HostExited,
    /// The worker reported that the debuggee exited.
    TargetExited,
    /// The worker connection dropped without a target exit.
    ConnectionLost,
    /// Closed by the caller.
    Closed,
    /// Bring-up failed, timed out or was cancelled.
    Aborted,
}

/// Runs registered teardown actions exactly once, in reverse registration
/// order, on the first call to [`SessionLifetime::terminate`].
pub struct SessionLifetime {
    teardown: Mutex<Teardown>,
    ended: watch::Sender<Option<SessionEnd>>,
}

#[derive(Default)]
struct Teardown {
    reason: Option<SessionEnd>,
    actions: Vec<TeardownAction>,
}

impl Default for SessionLifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLifetime {
    pub fn new() -> Self {
        let (ended, _) = watch::channel(None);
        Self {
            teardown: Mutex::new(Teardown::default()),
            ended,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Teardown> {
        match self.teardown.lock() {
            Ok(teardown) => teardown,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers cleanup for a resource owned by the session. If the lifetime
    /// has already ended the action is started right away.
    pub fn on_terminate<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action = boxed(action);
        let mut teardown = self.lock();
        if teardown.reason.is_some() {
            drop(teardown);
            tokio::spawn(action());
        } else {
            teardown.actions.push(action);
        }
    }

    /// Ends the lifetime and waits for teardown to finish. Returns `false`
    /// when it had already ended, in which case nothing runs again.
    pub async fn terminate(&self, reason: SessionEnd) -> bool {
        self.end(reason, None).await
    }

    /// Like [`terminate`](Self::terminate), running `first` ahead of the
    /// registered actions only if this call wins.
    pub(crate) async fn terminate_with<F, Fut>(&self, reason: SessionEnd, first: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.end(reason, Some(boxed(first))).await
    }

    async fn end(&self, reason: SessionEnd, first: Option<TeardownAction>) -> bool {
        let actions = {
            let mut teardown = self.lock();
            if teardown.reason.is_some() {
                return false;
            }
            teardown.reason = Some(reason);
            let mut actions = std::mem::take(&mut teardown.actions);
            actions.extend(first);
            actions
        };

        tracing::debug!(?reason, "tearing down debug session");
        for action in actions.into_iter().rev() {
            action().await;
        }
        self.ended.send_replace(Some(reason));
        true
    }

    /// True once termination has started.
    pub fn is_terminated(&self) -> bool {
        self.lock().reason.is_some()
    }

    pub fn end_reason(&self) -> Option<SessionEnd> {
        self.lock().reason
    }

    /// Resolves once teardown has finished.
    pub async fn wait(&self) -> SessionEnd {
        let mut ended = self.ended.subscribe();
        let reason = ended.wait_for(Option::is_some).await.map(|reason| *reason);
        // The sender lives in `self`, so the wait cannot observe it dropped.
        reason.ok().flatten().unwrap_or(SessionEnd::Closed)
    }
}

fn boxed<F, Fut>(action: F) -> TeardownAction
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || Box::pin(action()))
}

/// An attached debugger, linked to the host process it debugs.
///
/// The session ends when the host process exits, when the worker reports
/// the target exited (the host process is then terminated too), or when
/// [`DebugSession::close`] is called. Teardown runs once whichever comes first.
pub struct DebugSession {
    container_id: String,
    pid: u32,
    ports: DebugPorts,
    connection: Arc<RpcConnection>,
    lifetime: Arc<SessionLifetime>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl DebugSession {
    pub(crate) fn link(
        container_id: String,
        pid: u32,
        ports: DebugPorts,
        connection: Arc<RpcConnection>,
        host: Arc<dyn HostProcess>,
        lifetime: Arc<SessionLifetime>,
    ) -> Arc<Self> {
        let monitor = tokio::spawn(monitor_session(connection.clone(), host, lifetime.clone()));
        Arc::new(Self {
            container_id,
            pid,
            ports,
            connection,
            lifetime,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn ports(&self) -> DebugPorts {
        self.ports
    }

    pub fn connection(&self) -> &RpcConnection {
        &self.connection
    }

    pub fn is_terminated(&self) -> bool {
        self.lifetime.is_terminated()
    }

    pub fn end_reason(&self) -> Option<SessionEnd> {
        self.lifetime.end_reason()
    }

    pub async fn wait_terminated(&self) -> SessionEnd {
        self.lifetime.wait().await
    }

    /// Disconnects from the worker and tears the session down. The host
    /// process is left running. Returns `false` if the session had already
    /// ended.
    pub async fn close(&self) -> bool {
        // The lifetime is claimed before `disconnect` goes out, so a worker
        // hanging up after its reply cannot end the session as lost.
        let connection = self.connection.clone();
        let closed = self
            .lifetime
            .terminate_with(SessionEnd::Closed, move || async move {
                if let Err(e) = connection.request(DISCONNECT_COMMAND, Value::Null).await {
                    tracing::debug!(error = %e, "disconnect request failed");
                }
            })
            .await;
        let monitor = self.monitor.lock().ok().and_then(|mut monitor| monitor.take());
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        closed
    }
}

async fn monitor_session(
    connection: Arc<RpcConnection>,
    host: Arc<dyn HostProcess>,
    lifetime: Arc<SessionLifetime>,
) {
    tokio::select! {
        code = host.wait_exit() => {
            tracing::info!(exit_code = ?code, "host process exited, ending debug session");
            lifetime.terminate(SessionEnd::HostExited).await;
        }
        signal = connection.wait_target_exited() => {
            let reason = match signal {
                TargetSignal::Exited(code) => {
                    tracing::info!(exit_code = ?code, "debug target exited, stopping host process");
                    SessionEnd::TargetExited
                }
                TargetSignal::Disconnected => {
                    tracing::warn!("debugger worker connection lost, stopping host process");
                    SessionEnd::ConnectionLost
                }
            };
            let host = host.clone();
            lifetime
                .terminate_with(reason, move || async move { host.terminate().await })
                .await;
        }
        _ = lifetime.wait() => {}
    }
}
