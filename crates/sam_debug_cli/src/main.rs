//! sam-debug - runs a SAM application locally and attaches the debugger
//! worker to its runtime process.

mod args;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sam_debug_core::steps::{debug_pipeline, DEBUG_SESSION, HOST_PROCESS};
use sam_debug_core::{
    AttributeContext, ContainerExecLauncher, PipelineOutcome, SessionEnd, TokioCommandExecutor,
    TracingEmitter,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.config();
    let launch = args.debug_launch()?;
    let launcher = ContainerExecLauncher::new(config.container_cli.clone(), args.worker_command()?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if interrupt(&cancel) == Interrupt::Exit {
                    warn!("second interrupt received, exiting without cleanup");
                    std::process::exit(130);
                }
                info!("interrupt received, cancelling (press Ctrl-C again to force exit)");
            }
        });
    }

    let mut pipeline = debug_pipeline(launch, Arc::new(TokioCommandExecutor), Arc::new(launcher), &config);
    let mut context = AttributeContext::new();
    let outcome = pipeline.run(&mut context, &TracingEmitter, &cancel).await;

    match outcome {
        Ok(PipelineOutcome::Completed) => {}
        Ok(PipelineOutcome::Cancelled) => {
            stop_host(&context).await;
            info!("debug run cancelled");
            return Ok(());
        }
        Err(e) => {
            stop_host(&context).await;
            return Err(e).context("debug run failed");
        }
    }

    let session = context.get_required_attribute(&DEBUG_SESSION)?.clone();
    let ports = session.ports();
    info!(
        container = session.container_id(),
        pid = session.pid(),
        frontend = ports.frontend(),
        backend = ports.backend(),
        "debugger attached"
    );
    let reason = tokio::select! {
        reason = session.wait_terminated() => reason,
        _ = cancel.cancelled() => {
            session.close().await;
            stop_host(&context).await;
            SessionEnd::Closed
        }
    };
    info!(?reason, "debug session ended");
    Ok(())
}

/// Completed steps are not rolled back, so a host started before a failure
/// is stopped here.
async fn stop_host(context: &AttributeContext) {
    if let Some(host) = context.get_attribute(&HOST_PROCESS) {
        warn!(pid = ?host.pid(), "stopping host process");
        host.terminate().await;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    Cancel,
    Exit,
}

/// The first interrupt cancels the run. Any later one, arriving while
/// teardown is still underway, means the user wants out now.
fn interrupt(cancel: &CancellationToken) -> Interrupt {
    if cancel.is_cancelled() {
        Interrupt::Exit
    } else {
        cancel.cancel();
        Interrupt::Cancel
    }
}
