//! The steps of a local debug run and the keys they publish.

use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{DebuggerBridge, WorkerLauncher};
use crate::context::AttributeKey;
use crate::host::HostProcess;
use crate::locator::ContainerProcessLocator;
use crate::pipeline::{Step, StepPipeline};
use crate::ports::{DebugPorts, PortAllocator};
use crate::process::{CommandExecutor, CommandSpec, ProcessRunner};
use crate::session::DebugSession;
use crate::DebugConfig;

pub mod attach;
pub mod command;
pub mod discover;
pub mod launch;
pub mod ports;

pub use attach::AttachDebuggerStep;
pub use command::RunCommandStep;
pub use discover::{FindContainerStep, FindProcessStep};
pub use launch::LaunchHostProcessStep;
pub use ports::AllocatePortsStep;

pub const DEBUG_PORTS: AttributeKey<DebugPorts> = AttributeKey::new("debug_ports");
pub const CONTAINER_ID: AttributeKey<String> = AttributeKey::new("container_id");
pub const TARGET_PID: AttributeKey<u32> = AttributeKey::new("target_pid");
pub const HOST_PROCESS: AttributeKey<Arc<dyn HostProcess>> = AttributeKey::new("host_process");
pub const DEBUG_SESSION: AttributeKey<Arc<DebugSession>> = AttributeKey::new("debug_session");

pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// What to build, launch and attach to.
#[derive(Debug, Clone)]
pub struct DebugLaunch {
    pub build: Option<CommandSpec>,
    pub build_timeout: Duration,
    /// Host command; `{frontend}` and `{backend}` are replaced by the ports.
    pub launch: CommandSpec,
    /// Substring of the runtime's executable path or command line.
    pub runtime_marker: String,
}

impl DebugLaunch {
    pub fn new(launch: CommandSpec, runtime_marker: impl Into<String>) -> Self {
        Self {
            build: None,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            launch,
            runtime_marker: runtime_marker.into(),
        }
    }

    pub fn with_build(mut self, build: CommandSpec) -> Self {
        self.build = Some(build);
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }
}

/// Assembles the standard run: allocate ports, build, launch the host,
/// find the container and the runtime process, attach the debugger.
pub fn debug_pipeline(
    launch: DebugLaunch,
    executor: Arc<dyn CommandExecutor>,
    launcher: Arc<dyn WorkerLauncher>,
    config: &DebugConfig,
) -> StepPipeline {
    let runner = ProcessRunner::new(executor.clone(), config);
    let locator = ContainerProcessLocator::new(runner, config);
    let bridge = DebuggerBridge::new(launcher, config.clone());

    let mut steps: Vec<Box<dyn Step>> = vec![Box::new(AllocatePortsStep::new(PortAllocator::default()))];
    if let Some(build) = launch.build {
        steps.push(Box::new(RunCommandStep::new("Build", build, executor, launch.build_timeout)));
    }
    steps.push(Box::new(LaunchHostProcessStep::new(launch.launch)));
    steps.push(Box::new(FindContainerStep::new(locator.clone())));
    steps.push(Box::new(FindProcessStep::new(locator, launch.runtime_marker)));
    steps.push(Box::new(AttachDebuggerStep::new(bridge, config.host.clone())));
    StepPipeline::new(steps)
}
