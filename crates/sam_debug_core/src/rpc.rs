//! Framed JSON channel to the debugger worker running inside the container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::types::{
    RpcMessage, TargetExitedEvent, INITIALIZED_EVENT, OUTPUT_EVENT, TARGET_EXITED_EVENT,
};
use crate::{DebugError, Result};

/// Largest message body accepted from the worker.
pub const MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcMessage>>>>;

/// Readiness signals observed on the channel so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub initialized: bool,
    pub target_exited: bool,
    pub exit_code: Option<i32>,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSignal {
    Exited(Option<i32>),
    Disconnected,
}

pub struct RpcConnection {
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingRequests,
    state: watch::Receiver<ChannelState>,
    next_seq: AtomicU64,
    request_timeout: Duration,
    closed: AtomicBool,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RpcConnection {
    /// Dials `host:port` until the worker accepts, pausing `retry_interval`
    /// between refused attempts. Callers bound this with their own timeout.
    pub async fn connect(
        host: &str,
        port: u16,
        retry_interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            match TcpStream::connect((host, port)).await {
                Ok(stream) => {
                    tracing::debug!(host, port, attempts, "connected to debugger worker");
                    return Ok(Self::start(stream, request_timeout));
                }
                Err(e) => {
                    tracing::trace!(host, port, error = %e, "debugger worker not reachable yet");
                    sleep(retry_interval).await;
                }
            }
        }
    }

    pub fn start(stream: TcpStream, request_timeout: Duration) -> Self {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let (state_tx, state_rx) = watch::channel(ChannelState::default());
        let reader_task = tokio::spawn(reader_loop(read_half, pending.clone(), state_tx));

        Self {
            writer: Mutex::new(write_half),
            pending,
            state: state_rx,
            next_seq: AtomicU64::new(1),
            request_timeout,
            closed: AtomicBool::new(false),
            reader_task: std::sync::Mutex::new(Some(reader_task)),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.state().closed
    }

    /// Resolves once the worker has sent its `initialized` event.
    pub async fn wait_initialized(&self) -> Result<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| s.initialized || s.closed)
            .await
            .map(|s| *s);
        match reached {
            Ok(s) if s.initialized => Ok(()),
            _ => Err(DebugError::Protocol(
                "debugger worker closed the connection before initializing".into(),
            )),
        }
    }

    /// Resolves when the worker reports the target exited or the channel drops.
    pub async fn wait_target_exited(&self) -> TargetSignal {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| s.target_exited || s.closed)
            .await
            .map(|s| *s);
        match reached {
            Ok(s) if s.target_exited => TargetSignal::Exited(s.exit_code),
            _ => TargetSignal::Disconnected,
        }
    }

    pub async fn request(&self, command: &str, arguments: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(DebugError::Protocol(format!(
                "cannot send '{command}': connection is closed"
            )));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let message = RpcMessage::request(seq, command, arguments);
        tracing::debug!("Sending worker request: command={}, seq={}", command, seq);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_message(&mut *writer, &message).await {
                self.pending.lock().await.remove(&seq);
                return Err(e);
            }
        }

        let response = match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(DebugError::Protocol(format!(
                    "connection closed while waiting for '{command}'"
                )));
            }
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                return Err(DebugError::Protocol(format!(
                    "timed out after {:?} waiting for '{command}'",
                    self.request_timeout
                )));
            }
        };

        match response {
            RpcMessage::Response {
                success: true,
                body,
                ..
            } => {
                tracing::debug!("Worker request successful: command={}, seq={}", command, seq);
                Ok(body)
            }
            RpcMessage::Response { message, .. } => {
                let message = message.unwrap_or_else(|| "unknown worker error".to_string());
                tracing::warn!("Worker request failed: command={}, message={}", command, message);
                Err(DebugError::RequestFailed {
                    command: command.to_string(),
                    message,
                })
            }
            other => Err(DebugError::Protocol(format!(
                "unexpected {} in reply to '{command}'",
                other.kind()
            ))),
        }
    }

    /// Stops the reader and shuts the socket down. Returns `false` if the
    /// connection had already been closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let reader_task = self
            .reader_task
            .lock()
            .ok()
            .and_then(|mut task| task.take());
        if let Some(task) = reader_task {
            task.abort();
        }
        self.pending.lock().await.clear();
        let _ = self.writer.lock().await.shutdown().await;
        tracing::debug!("debugger worker connection closed");
        true
    }
}

async fn reader_loop(
    read_half: OwnedReadHalf,
    pending: PendingRequests,
    state: watch::Sender<ChannelState>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        let message = match read_message(&mut reader).await {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "debugger worker reader stopped");
                break;
            }
        };
        tracing::trace!(kind = message.kind(), "inbound worker message");

        match message {
            RpcMessage::Response { request_seq, .. } => {
                if let Some(tx) = pending.lock().await.remove(&request_seq) {
                    let _ = tx.send(message);
                }
            }
            RpcMessage::Event { ref event, ref body } => match event.as_str() {
                INITIALIZED_EVENT => state.send_modify(|s| s.initialized = true),
                TARGET_EXITED_EVENT => {
                    let exit_code = serde_json::from_value::<TargetExitedEvent>(body.clone())
                        .ok()
                        .and_then(|e| e.exit_code);
                    state.send_modify(|s| {
                        s.target_exited = true;
                        s.exit_code = exit_code;
                    });
                }
                OUTPUT_EVENT => {
                    if let Some(output) = body.get("output").and_then(Value::as_str) {
                        tracing::info!(target: "debugger_worker", "{}", output.trim_end());
                    }
                }
                other => tracing::debug!(event = other, "ignoring worker event"),
            },
            RpcMessage::Request { ref command, .. } => {
                tracing::debug!(command = %command, "ignoring request sent by worker");
            }
        }
    }

    pending.lock().await.clear();
    state.send_modify(|s| s.closed = true);
}

pub async fn write_message<W>(writer: &mut W, message: &RpcMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_string(message)?;
    let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    writer.write_all(framed.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R>(reader: &mut BufReader<R>) -> std::io::Result<RpcMessage>
where
    R: AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed while reading message headers",
            ));
        }

        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            break;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                let parsed = value.trim().parse::<usize>().map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid Content-Length value: {e}"),
                    )
                })?;
                content_length = Some(parsed);
            }
        }
    }

    let length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing required Content-Length header",
        )
    })?;

    if length > MAX_MESSAGE_LENGTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Content-Length {length} exceeds the {MAX_MESSAGE_LENGTH} byte limit"),
        ));
    }

    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice::<RpcMessage>(&body).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid message payload: {e}"),
        )
    })
}
