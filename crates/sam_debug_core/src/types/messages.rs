use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const INITIALIZED_EVENT: &str = "initialized";
pub const TARGET_EXITED_EVENT: &str = "targetExited";
pub const OUTPUT_EVENT: &str = "output";

pub const OPEN_BACKEND_COMMAND: &str = "openBackend";
pub const SET_ACTIVE_SESSION_COMMAND: &str = "setActiveSession";
pub const DISCONNECT_COMMAND: &str = "disconnect";

fn default_true() -> bool {
    true
}

/// One framed message exchanged with the debugger worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RpcMessage {
    Request {
        seq: u64,
        command: String,
        #[serde(default)]
        arguments: Value,
    },
    Response {
        request_seq: u64,
        #[serde(default = "default_true")]
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        body: Value,
    },
    Event {
        event: String,
        #[serde(default)]
        body: Value,
    },
}

impl RpcMessage {
    pub fn request(seq: u64, command: impl Into<String>, arguments: Value) -> Self {
        Self::Request {
            seq,
            command: command.into(),
            arguments,
        }
    }

    pub fn success(request_seq: u64, body: Value) -> Self {
        Self::Response {
            request_seq,
            success: true,
            message: None,
            body,
        }
    }

    pub fn failure(request_seq: u64, message: impl Into<String>) -> Self {
        Self::Response {
            request_seq,
            success: false,
            message: Some(message.into()),
            body: Value::Null,
        }
    }

    pub fn event(event: impl Into<String>, body: Value) -> Self {
        Self::Event {
            event: event.into(),
            body,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Event { .. } => "event",
        }
    }
}
