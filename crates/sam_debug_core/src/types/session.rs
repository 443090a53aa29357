use serde::{Deserialize, Serialize};

/// Published to the worker as the active session once the channel is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachSession {
    pub process_id: u32,
    pub container_id: String,
    pub frontend_port: u16,
    pub backend_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenBackendRequest {
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetExitedEvent {
    #[serde(default)]
    pub exit_code: Option<i32>,
}
