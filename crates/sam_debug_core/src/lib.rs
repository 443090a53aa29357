//! SAM Debug Core
//!
//! Async orchestration for debugging a locally emulated SAM/Lambda function:
//! reserves debugger ports, launches the host application, discovers the
//! runtime container and the process inside it, and attaches a debugger
//! worker whose session lifetime is tied to the host process.

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod locator;
pub mod pipeline;
pub mod ports;
pub mod process;
pub mod rpc;
pub mod session;
pub mod steps;
pub mod types;

// Re-export commonly used types
pub use bridge::{AttachRequest, ContainerExecLauncher, DebuggerBridge, WorkerLauncher};
pub use config::DebugConfig;
pub use context::{AttributeContext, AttributeKey};
pub use error::DebugError;
pub use host::{ChildHostProcess, HostProcess};
pub use locator::ContainerProcessLocator;
pub use pipeline::{MessageEmitter, PipelineOutcome, PipelineState, Step, StepPipeline, TracingEmitter};
pub use ports::{DebugPorts, PortAllocator};
pub use process::{CommandExecutor, CommandSpec, ProcessOutput, ProcessRunner, TokioCommandExecutor};
pub use session::{DebugSession, SessionEnd};

/// Result type alias using DebugError
pub type Result<T> = std::result::Result<T, DebugError>;
