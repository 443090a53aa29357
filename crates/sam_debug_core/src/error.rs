use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("Timed out after {elapsed:?} running `{command}` (last exit code: {exit_code:?})\nstdout: {stdout}\nstderr: {stderr}")]
    ProcessDiscoveryTimeout {
        command: String,
        elapsed: Duration,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("No container publishing port {port} was found")]
    ContainerNotFound {
        port: u16,
        #[source]
        source: Box<DebugError>,
    },

    #[error("No process matching '{marker}' was found in container {container}")]
    ProcessNotFound {
        container: String,
        marker: String,
        #[source]
        source: Box<DebugError>,
    },

    #[error("Debugger worker did not connect within {0:?}")]
    DebuggerConnectTimeout(Duration),

    #[error("Required attribute '{0}' is missing from the context")]
    MissingAttribute(&'static str),

    #[error("Attribute '{0}' was already set")]
    DuplicateAttribute(&'static str),

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<DebugError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Pipeline cannot run from state {0}")]
    InvalidState(String),

    #[error("Command `{command}` exited with code {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Port allocation failed: {0}")]
    PortAllocation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request '{command}' failed: {message}")]
    RequestFailed { command: String, message: String },

    #[error("Deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DebugError {
    pub fn step(step: impl Into<String>, source: DebugError) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// True when the error, or the step error wrapping it, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Step { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Name of the pipeline step that failed, if the error went through one.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::Step { step, .. } => Some(step),
            _ => None,
        }
    }
}
