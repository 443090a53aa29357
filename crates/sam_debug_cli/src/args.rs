use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sam_debug_core::steps::DebugLaunch;
use sam_debug_core::{CommandSpec, DebugConfig};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Substring of the runtime executable or command line to attach to.
    #[arg(long, default_value = "dotnet")]
    pub marker: String,

    /// Debugger worker command run inside the container. `{frontend}`,
    /// `{backend}` and `{pid}` are substituted.
    #[arg(long, env = "SAM_DEBUG_WORKER")]
    pub worker: String,

    /// Command run to completion before launching, e.g. "sam build".
    #[arg(long)]
    pub build: Option<String>,

    /// Address the debugger worker ports are published on.
    #[arg(long)]
    pub host: Option<String>,

    /// Container engine CLI (docker, finch, podman).
    #[arg(long)]
    pub container_cli: Option<String>,

    /// Timeout for discovery and debugger attach, in seconds.
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Upper bound for one container listing or process scan, in seconds.
    #[arg(long)]
    pub attempt_timeout: Option<u64>,

    /// Timeout for the --build command, in seconds.
    #[arg(long)]
    pub build_timeout: Option<u64>,

    /// Host command, e.g. `sam local invoke --debug-port {frontend} ...`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub launch: Vec<String>,
}

impl Args {
    /// Flags override the environment, which overrides the defaults.
    pub fn config(&self) -> DebugConfig {
        let mut config = DebugConfig::from_env();
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(cli) = &self.container_cli {
            config.container_cli = cli.clone();
        }
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.attempt_timeout {
            config = config.with_attempt_timeout(Duration::from_secs(secs));
        }
        config
    }

    pub fn worker_command(&self) -> anyhow::Result<CommandSpec> {
        CommandSpec::from_words(&self.worker).context("--worker must not be empty")
    }

    pub fn debug_launch(&self) -> anyhow::Result<DebugLaunch> {
        let (program, args) = self
            .launch
            .split_first()
            .context("a launch command is required")?;
        let mut launch = DebugLaunch::new(CommandSpec::new(program).args(args), &self.marker);
        if let Some(build) = &self.build {
            let build = CommandSpec::from_words(build).context("--build must not be empty")?;
            launch = launch.with_build(build);
        }
        if let Some(secs) = self.build_timeout {
            launch = launch.with_build_timeout(Duration::from_secs(secs));
        }
        Ok(launch)
    }
}
