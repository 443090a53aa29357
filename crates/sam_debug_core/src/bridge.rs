//! Brings up the debugger worker inside the container and links the
//! resulting session to the host process.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::host::{forward_lines, HostProcess};
use crate::ports::DebugPorts;
use crate::process::CommandSpec;
use crate::rpc::RpcConnection;
use crate::session::{DebugSession, SessionEnd, SessionLifetime};
use crate::types::{AttachSession, OpenBackendRequest, OPEN_BACKEND_COMMAND, SET_ACTIVE_SESSION_COMMAND};
use crate::{DebugConfig, DebugError, Result};

/// A running debugger worker. Dropping it must not leave the worker running.
#[async_trait]
pub trait WorkerHandle: Send {
    async fn shutdown(&mut self);
}

/// Starts the debugger worker next to the target process.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, container_id: &str, ports: DebugPorts, pid: u32)
        -> Result<Box<dyn WorkerHandle>>;
}

/// Runs the worker with `<cli> exec -i <container> <worker command>`.
///
/// The worker command may use the `{frontend}`, `{backend}` and `{pid}`
/// placeholders.
#[derive(Debug, Clone)]
pub struct ContainerExecLauncher {
    container_cli: String,
    worker: CommandSpec,
}

impl ContainerExecLauncher {
    pub fn new(container_cli: impl Into<String>, worker: CommandSpec) -> Self {
        Self {
            container_cli: container_cli.into(),
            worker,
        }
    }

    pub fn exec_command(&self, container_id: &str, ports: DebugPorts, pid: u32) -> CommandSpec {
        let worker = self.worker.substitute(&[
            ("frontend", ports.frontend().to_string()),
            ("backend", ports.backend().to_string()),
            ("pid", pid.to_string()),
        ]);
        CommandSpec::new(&self.container_cli)
            .args(["exec", "-i", container_id])
            .arg(worker.program)
            .args(worker.args)
    }
}

#[async_trait]
impl WorkerLauncher for ContainerExecLauncher {
    async fn launch(
        &self,
        container_id: &str,
        ports: DebugPorts,
        pid: u32,
    ) -> Result<Box<dyn WorkerHandle>> {
        let command = self.exec_command(container_id, ports, pid);
        tracing::info!(command = %command, "starting debugger worker");

        let mut child = command
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "worker", false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "worker", true));
        }

        Ok(Box::new(ChildWorker { child }))
    }
}

struct ChildWorker {
    child: Child,
}

#[async_trait]
impl WorkerHandle for ChildWorker {
    async fn shutdown(&mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
        tracing::debug!("debugger worker stopped");
    }
}

/// Everything needed to attach to one discovered process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub host: String,
    pub ports: DebugPorts,
    pub container_id: String,
    pub pid: u32,
}

pub struct DebuggerBridge {
    launcher: Arc<dyn WorkerLauncher>,
    config: DebugConfig,
}

impl DebuggerBridge {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: DebugConfig) -> Self {
        Self { launcher, config }
    }

    /// Starts the worker, connects to it and activates the session for
    /// `request.pid`.
    ///
    /// The whole chain runs under one watchdog of `connect_timeout`. On any
    /// failure the partially built state is torn down before the error is
    /// returned.
    pub async fn attach(
        &self,
        request: &AttachRequest,
        host: Arc<dyn HostProcess>,
        cancel: &CancellationToken,
    ) -> Result<Arc<DebugSession>> {
        let lifetime = Arc::new(SessionLifetime::new());
        let deadline = self.config.connect_timeout;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DebugError::Cancelled),
            _ = sleep(deadline) => Err(DebugError::DebuggerConnectTimeout(deadline)),
            result = self.bring_up(request, &lifetime) => result,
        };

        match outcome {
            Ok(connection) => {
                tracing::info!(
                    container = %request.container_id,
                    pid = request.pid,
                    frontend = request.ports.frontend(),
                    backend = request.ports.backend(),
                    "debugger attached"
                );
                Ok(DebugSession::link(
                    request.container_id.clone(),
                    request.pid,
                    request.ports,
                    connection,
                    host,
                    lifetime,
                ))
            }
            Err(e) => {
                tracing::warn!(error = %e, "debugger attach failed, cleaning up");
                lifetime.terminate(SessionEnd::Aborted).await;
                Err(e)
            }
        }
    }

    /// Every resource is handed to `lifetime` right after it is created, with
    /// no await in between, so dropping this future never leaks one.
    async fn bring_up(
        &self,
        request: &AttachRequest,
        lifetime: &SessionLifetime,
    ) -> Result<Arc<RpcConnection>> {
        let worker = self
            .launcher
            .launch(&request.container_id, request.ports, request.pid)
            .await?;
        lifetime.on_terminate(move || async move {
            let mut worker = worker;
            worker.shutdown().await;
        });

        let connection = RpcConnection::connect(
            &request.host,
            request.ports.frontend(),
            self.config.poll_interval,
            self.config.request_timeout,
        )
        .await?;
        let connection = Arc::new(connection);
        {
            let connection = connection.clone();
            lifetime.on_terminate(move || async move {
                connection.close().await;
            });
        }

        connection.wait_initialized().await?;
        tracing::debug!("debugger worker initialized");

        let open_backend = serde_json::to_value(OpenBackendRequest {
            port: request.ports.backend(),
        })?;
        connection.request(OPEN_BACKEND_COMMAND, open_backend).await?;

        let backend =
            connect_backend(&request.host, request.ports.backend(), self.config.poll_interval).await;
        let _ = backend.set_nodelay(true);
        lifetime.on_terminate(move || async move {
            let mut backend = backend;
            let _ = backend.shutdown().await;
        });

        let session = serde_json::to_value(AttachSession {
            process_id: request.pid,
            container_id: request.container_id.clone(),
            frontend_port: request.ports.frontend(),
            backend_port: request.ports.backend(),
        })?;
        connection.request(SET_ACTIVE_SESSION_COMMAND, session).await?;

        Ok(connection)
    }
}

/// Dials the backend leg until the worker accepts it.
async fn connect_backend(host: &str, port: u16, retry_interval: Duration) -> TcpStream {
    loop {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => {
                tracing::debug!(host, port, "backend leg connected");
                return stream;
            }
            Err(e) => {
                tracing::trace!(host, port, error = %e, "backend leg not reachable yet");
                sleep(retry_interval).await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rpc::{read_message, write_message};
    use crate::types::{RpcMessage, DISCONNECT_COMMAND, INITIALIZED_EVENT, TARGET_EXITED_EVENT};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;
    use tokio::sync::{oneshot, watch};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    /// Launcher that starts nothing and counts shutdowns.
    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub launches: Mutex<Vec<(String, DebugPorts, u32)>>,
        pub shutdowns: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl FakeLauncher {
        pub fn shutdown_count(&self) -> usize {
            self.shutdowns.load(Ordering::SeqCst)
        }
    }

    struct FakeWorkerHandle {
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerHandle for FakeWorkerHandle {
        async fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(
            &self,
            container_id: &str,
            ports: DebugPorts,
            pid: u32,
        ) -> Result<Box<dyn WorkerHandle>> {
            if self.fail {
                return Err(DebugError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "docker not installed",
                )));
            }
            self.launches
                .lock()
                .unwrap()
                .push((container_id.to_string(), ports, pid));
            Ok(Box::new(FakeWorkerHandle {
                shutdowns: self.shutdowns.clone(),
            }))
        }
    }

    /// Host process whose exit is driven by the test.
    pub(crate) struct FakeHost {
        exit: watch::Sender<Option<Option<i32>>>,
        pub terminations: AtomicUsize,
    }

    impl FakeHost {
        pub fn new() -> Arc<Self> {
            let (exit, _) = watch::channel(None);
            Arc::new(Self {
                exit,
                terminations: AtomicUsize::new(0),
            })
        }

        pub fn exit_with(&self, code: i32) {
            self.exit.send_if_modified(|state| {
                let first = state.is_none();
                if first {
                    *state = Some(Some(code));
                }
                first
            });
        }

        pub fn termination_count(&self) -> usize {
            self.terminations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HostProcess for FakeHost {
        fn pid(&self) -> Option<u32> {
            Some(1)
        }

        async fn wait_exit(&self) -> Option<i32> {
            let mut exit = self.exit.subscribe();
            let state = exit.wait_for(Option::is_some).await.map(|state| *state);
            state.ok().flatten().flatten()
        }

        async fn terminate(&self) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            self.exit.send_if_modified(|state| {
                let first = state.is_none();
                if first {
                    *state = Some(None);
                }
                first
            });
        }
    }

    /// In-process stand-in for the debugger worker, listening on both ports.
    pub(crate) struct FakeWorker {
        pub ports: DebugPorts,
        pub target_exit: Option<oneshot::Sender<i32>>,
        /// Requests seen, returned once the host closes the connection.
        pub task: JoinHandle<Vec<(String, Value)>>,
    }

    impl FakeWorker {
        pub async fn start(send_initialized: bool) -> Self {
            let frontend = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let ports = DebugPorts::new(
                frontend.local_addr().unwrap().port(),
                backend.local_addr().unwrap().port(),
            );
            let (exit_tx, mut exit_rx) = oneshot::channel::<i32>();

            let task = tokio::spawn(async move {
                let (stream, _) = frontend.accept().await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                if send_initialized {
                    let initialized = RpcMessage::event(INITIALIZED_EVENT, Value::Null);
                    write_message(&mut write_half, &initialized).await.unwrap();
                }

                let mut requests = Vec::new();
                let mut backend_leg = None;
                let mut exit_pending = true;
                loop {
                    tokio::select! {
                        message = read_message(&mut reader) => {
                            let Ok(RpcMessage::Request { seq, command, arguments }) = message else {
                                break;
                            };
                            let reply = RpcMessage::success(seq, Value::Null);
                            if write_message(&mut write_half, &reply).await.is_err() {
                                break;
                            }
                            if command == OPEN_BACKEND_COMMAND {
                                backend_leg = Some(backend.accept().await.unwrap().0);
                            }
                            // Like a real worker, hang up once disconnect is answered.
                            let hang_up = command == DISCONNECT_COMMAND;
                            requests.push((command, arguments));
                            if hang_up {
                                break;
                            }
                        }
                        code = &mut exit_rx, if exit_pending => {
                            exit_pending = false;
                            if let Ok(code) = code {
                                let exited = RpcMessage::event(TARGET_EXITED_EVENT, json!({"exitCode": code}));
                                let _ = write_message(&mut write_half, &exited).await;
                            }
                        }
                    }
                }
                drop(backend_leg);
                requests
            });

            Self {
                ports,
                target_exit: Some(exit_tx),
                task,
            }
        }

        pub fn report_target_exit(&mut self, code: i32) {
            if let Some(tx) = self.target_exit.take() {
                let _ = tx.send(code);
            }
        }
    }

    fn config(connect_timeout: Duration) -> DebugConfig {
        DebugConfig::new("127.0.0.1", connect_timeout)
            .with_poll_interval(Duration::from_millis(10))
            .with_request_timeout(Duration::from_secs(2))
    }

    fn request(ports: DebugPorts) -> AttachRequest {
        AttachRequest {
            host: "127.0.0.1".to_string(),
            ports,
            container_id: "c1".to_string(),
            pid: 4242,
        }
    }

    #[test]
    fn test_exec_command_substitutes_placeholders() {
        let worker = CommandSpec::new("/opt/debugger/worker").args([
            "--frontend-port={frontend}",
            "--backend-port={backend}",
            "--pid",
            "{pid}",
        ]);
        let launcher = ContainerExecLauncher::new("docker", worker);
        let command = launcher.exec_command("c1", DebugPorts::new(5858, 5859), 17);
        assert_eq!(
            command.command_line(),
            "docker exec -i c1 /opt/debugger/worker --frontend-port=5858 --backend-port=5859 --pid 17"
        );
    }

    #[tokio::test]
    async fn test_attach_activates_session() {
        let worker = FakeWorker::start(true).await;
        let launcher = Arc::new(FakeLauncher::default());
        let bridge = DebuggerBridge::new(launcher.clone(), config(Duration::from_secs(5)));
        let host = FakeHost::new();

        let session = bridge
            .attach(&request(worker.ports), host.clone(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.pid(), 4242);
        assert_eq!(session.container_id(), "c1");
        assert_eq!(session.ports(), worker.ports);
        assert!(!session.is_terminated());
        assert_eq!(
            *launcher.launches.lock().unwrap(),
            vec![("c1".to_string(), worker.ports, 4242)]
        );

        assert!(session.close().await);
        assert!(!session.close().await);
        assert_eq!(session.end_reason(), Some(SessionEnd::Closed));
        assert_eq!(launcher.shutdown_count(), 1);
        assert_eq!(host.termination_count(), 0);

        let requests = timeout(Duration::from_secs(2), worker.task).await.unwrap().unwrap();
        let commands: Vec<&str> = requests.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(
            commands,
            vec![OPEN_BACKEND_COMMAND, SET_ACTIVE_SESSION_COMMAND, DISCONNECT_COMMAND]
        );
        assert_eq!(requests[0].1, json!({"port": worker.ports.backend()}));
        assert_eq!(requests[1].1["processId"], json!(4242));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_launcher_spawns_and_kills_worker() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("sam-debug-launcher-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let record = dir.join("worker.txt");
        let cli = dir.join("fake-docker");
        std::fs::write(
            &cli,
            format!("#!/bin/sh\necho \"$$ $*\" > '{}'\nexec sleep 30\n", record.display()),
        )
        .unwrap();
        std::fs::set_permissions(&cli, std::fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = ContainerExecLauncher::new(
            cli.display().to_string(),
            CommandSpec::new("worker").args(["--port", "{frontend}", "--pid", "{pid}"]),
        );
        let mut worker = launcher
            .launch("c1", DebugPorts::new(5858, 5859), 17)
            .await
            .unwrap();

        let mut line = String::new();
        for _ in 0..100 {
            line = std::fs::read_to_string(&record).unwrap_or_default();
            if line.ends_with('\n') {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        let (pid, args) = line.trim_end().split_once(' ').unwrap();
        assert_eq!(args, "exec -i c1 worker --port 5858 --pid 17");

        timeout(Duration::from_secs(5), worker.shutdown()).await.unwrap();

        let alive = std::process::Command::new("sh")
            .args(["-c", &format!("kill -0 {pid}")])
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(!alive.success(), "worker {pid} still running after shutdown");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_keeps_host_when_worker_hangs_up() {
        for _ in 0..20 {
            let worker = FakeWorker::start(true).await;
            let launcher = Arc::new(FakeLauncher::default());
            let bridge = DebuggerBridge::new(launcher.clone(), config(Duration::from_secs(5)));
            let host = FakeHost::new();

            let session = bridge
                .attach(&request(worker.ports), host.clone(), &CancellationToken::new())
                .await
                .unwrap();

            assert!(session.close().await);
            assert_eq!(session.end_reason(), Some(SessionEnd::Closed));
            assert_eq!(session.wait_terminated().await, SessionEnd::Closed);
            assert_eq!(host.termination_count(), 0);
            assert_eq!(launcher.shutdown_count(), 1);

            let requests = timeout(Duration::from_secs(2), worker.task).await.unwrap().unwrap();
            assert_eq!(requests.last().map(|(c, _)| c.as_str()), Some(DISCONNECT_COMMAND));
        }
    }

    #[tokio::test]
    async fn test_connect_timeout_tears_down_worker() {
        let ports = crate::ports::PortAllocator::default().allocate_pair().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let bridge = DebuggerBridge::new(launcher.clone(), config(Duration::from_millis(150)));

        let started = std::time::Instant::now();
        let err = bridge
            .attach(&request(ports), FakeHost::new(), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, DebugError::DebuggerConnectTimeout(_)), "{err:?}");
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(launcher.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_initialized_times_out() {
        let worker = FakeWorker::start(false).await;
        let launcher = Arc::new(FakeLauncher::default());
        let bridge = DebuggerBridge::new(launcher.clone(), config(Duration::from_millis(200)));

        let err = bridge
            .attach(&request(worker.ports), FakeHost::new(), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, DebugError::DebuggerConnectTimeout(_)), "{err:?}");
        assert_eq!(launcher.shutdown_count(), 1);
        // The socket was closed, so the worker sees the host hang up.
        let requests = timeout(Duration::from_secs(2), worker.task).await.unwrap().unwrap();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_connect() {
        let ports = crate::ports::PortAllocator::default().allocate_pair().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let bridge = DebuggerBridge::new(launcher.clone(), config(Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            });
        }

        let err = bridge
            .attach(&request(ports), FakeHost::new(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DebugError::Cancelled));
        assert_eq!(launcher.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_surfaced() {
        let launcher = Arc::new(FakeLauncher {
            fail: true,
            ..FakeLauncher::default()
        });
        let bridge = DebuggerBridge::new(launcher.clone(), config(Duration::from_secs(1)));

        let err = bridge
            .attach(&request(DebugPorts::new(1, 2)), FakeHost::new(), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DebugError::Io(_)));
        assert_eq!(launcher.shutdown_count(), 0);
    }

    #[tokio::test]
    async fn test_target_exit_terminates_host() {
        let mut worker = FakeWorker::start(true).await;
        let launcher = Arc::new(FakeLauncher::default());
        let bridge = DebuggerBridge::new(launcher.clone(), config(Duration::from_secs(5)));
        let host = FakeHost::new();

        let session = bridge
            .attach(&request(worker.ports), host.clone(), &CancellationToken::new())
            .await
            .unwrap();
        worker.report_target_exit(0);

        let reason = timeout(Duration::from_secs(2), session.wait_terminated()).await.unwrap();
        assert_eq!(reason, SessionEnd::TargetExited);
        assert_eq!(host.termination_count(), 1);
        assert_eq!(launcher.shutdown_count(), 1);
        assert!(!session.close().await);
    }

    #[tokio::test]
    async fn test_host_exit_tears_down_session() {
        let worker = FakeWorker::start(true).await;
        let launcher = Arc::new(FakeLauncher::default());
        let bridge = DebuggerBridge::new(launcher.clone(), config(Duration::from_secs(5)));
        let host = FakeHost::new();

        let session = bridge
            .attach(&request(worker.ports), host.clone(), &CancellationToken::new())
            .await
            .unwrap();
        host.exit_with(0);

        let reason = timeout(Duration::from_secs(2), session.wait_terminated()).await.unwrap();
        assert_eq!(reason, SessionEnd::HostExited);
        assert_eq!(host.termination_count(), 0);
        assert_eq!(launcher.shutdown_count(), 1);
        assert!(session.connection().is_closed());
    }

    #[tokio::test]
    async fn test_simultaneous_triggers_tear_down_once() {
        let mut worker = FakeWorker::start(true).await;
        let launcher = Arc::new(FakeLauncher::default());
        let bridge = DebuggerBridge::new(launcher.clone(), config(Duration::from_secs(5)));
        let host = FakeHost::new();

        let session = bridge
            .attach(&request(worker.ports), host.clone(), &CancellationToken::new())
            .await
            .unwrap();
        worker.report_target_exit(1);
        host.exit_with(1);

        let reason = timeout(Duration::from_secs(2), session.wait_terminated()).await.unwrap();
        assert!(matches!(reason, SessionEnd::TargetExited | SessionEnd::HostExited));
        // Give a losing trigger time to run if it were going to.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.shutdown_count(), 1);
        assert!(host.termination_count() <= 1);
    }
}
