use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::process::{CommandSpec, ProcessOutput, ProcessRunner};
use crate::{DebugConfig, DebugError, Result};

/// Prints `pid|exe|cmdline` for every process visible in the container,
/// skipping the scanning shell itself.
const PROC_SCAN_SCRIPT: &str = r#"for p in /proc/[0-9]*; do pid="${p#/proc/}"; [ "$pid" = "$$" ] && continue; exe="$(readlink "$p/exe" 2>/dev/null)"; cmd="$(tr '\0' ' ' < "$p/cmdline" 2>/dev/null)"; echo "$pid|$exe|$cmd"; done"#;

/// Finds the container publishing a debugger port and the runtime process
/// inside it.
#[derive(Clone)]
pub struct ContainerProcessLocator {
    runner: ProcessRunner,
    container_cli: String,
    deadline: Duration,
}

impl ContainerProcessLocator {
    pub fn new(runner: ProcessRunner, config: &DebugConfig) -> Self {
        Self {
            runner,
            container_cli: config.container_cli.clone(),
            deadline: config.connect_timeout,
        }
    }

    pub fn list_by_port_command(&self, published_port: u16) -> CommandSpec {
        CommandSpec::new(&self.container_cli).args([
            "ps".to_string(),
            "-q".to_string(),
            "--filter".to_string(),
            format!("publish={published_port}"),
        ])
    }

    pub fn process_scan_command(&self, container: &str) -> CommandSpec {
        CommandSpec::new(&self.container_cli).args(["exec", container, "/bin/sh", "-c", PROC_SCAN_SCRIPT])
    }

    pub async fn find_container(
        &self,
        published_port: u16,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let command = self.list_by_port_command(published_port);
        let container = self
            .runner
            .run_until(self.deadline, &command, cancel, first_container_id)
            .await
            .map_err(|e| match e {
                DebugError::ProcessDiscoveryTimeout { .. } => DebugError::ContainerNotFound {
                    port: published_port,
                    source: Box::new(e),
                },
                other => other,
            })?;

        tracing::info!(container = %container, port = published_port, "found debug container");
        Ok(container)
    }

    pub async fn find_process(
        &self,
        container: &str,
        marker: &str,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let command = self.process_scan_command(container);
        let pid = self
            .runner
            .run_until(self.deadline, &command, cancel, |output| {
                output
                    .success()
                    .then(|| find_matching_pid(&output.stdout, marker))
                    .flatten()
            })
            .await
            .map_err(|e| match e {
                DebugError::ProcessDiscoveryTimeout { .. } => DebugError::ProcessNotFound {
                    container: container.to_string(),
                    marker: marker.to_string(),
                    source: Box::new(e),
                },
                other => other,
            })?;

        tracing::info!(container = %container, pid, marker, "found target process");
        Ok(pid)
    }

    /// Runs both discovery steps back to back.
    pub async fn locate(
        &self,
        published_port: u16,
        marker: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, u32)> {
        let container = self.find_container(published_port, cancel).await?;
        let pid = self.find_process(&container, marker, cancel).await?;
        Ok((container, pid))
    }
}

fn first_container_id(output: &ProcessOutput) -> Option<String> {
    if !output.success() {
        return None;
    }
    output
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// First pid whose executable path or command line contains `marker`.
///
/// With several matches the earliest line wins; a Lambda container runs one
/// runtime process, so listing order does not matter in practice.
fn find_matching_pid(listing: &str, marker: &str) -> Option<u32> {
    listing.lines().find_map(|line| {
        let mut fields = line.splitn(3, '|');
        let pid = fields.next()?.trim().parse::<u32>().ok()?;
        let exe = fields.next().unwrap_or_default();
        let cmdline = fields.next().unwrap_or_default();
        (exe.contains(marker) || cmdline.contains(marker)).then_some(pid)
    })
}
