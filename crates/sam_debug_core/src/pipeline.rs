//! Sequential, cancellable step execution with progress reporting.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::AttributeContext;
use crate::{DebugError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Progress surface the pipeline reports to.
pub trait MessageEmitter: Send + Sync {
    fn step_started(&self, name: &str);

    fn emit(&self, text: &str, is_error: bool);

    fn step_finished(&self, name: &str, outcome: &StepOutcome);
}

/// Reports progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEmitter;

impl MessageEmitter for TracingEmitter {
    fn step_started(&self, name: &str) {
        tracing::info!(step = name, "step started");
    }

    fn emit(&self, text: &str, is_error: bool) {
        let text = text.trim_end();
        if is_error {
            tracing::error!("{}", text);
        } else {
            tracing::info!("{}", text);
        }
    }

    fn step_finished(&self, name: &str, outcome: &StepOutcome) {
        match outcome {
            StepOutcome::Succeeded => tracing::info!(step = name, "step finished"),
            StepOutcome::Failed(error) => tracing::error!(step = name, error = %error, "step failed"),
            StepOutcome::Cancelled => tracing::warn!(step = name, "step cancelled"),
        }
    }
}

/// One unit of work in a [`StepPipeline`].
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Hidden steps run without being reported to the emitter.
    fn hidden(&self) -> bool {
        false
    }

    /// Steps that must run even after cancellation was requested.
    fn ignore_cancellation(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        context: &mut AttributeContext,
        emitter: &dyn MessageEmitter,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Cancelled,
}

/// Runs its steps in order, stopping at the first failure.
///
/// A pipeline runs once. Completed steps are not rolled back when a later
/// one fails; resources they published stay in the context for the caller.
pub struct StepPipeline {
    steps: Vec<Box<dyn Step>>,
    state: PipelineState,
}

impl StepPipeline {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            steps,
            state: PipelineState::NotStarted,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub async fn run(
        &mut self,
        context: &mut AttributeContext,
        emitter: &dyn MessageEmitter,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        if self.state != PipelineState::NotStarted {
            return Err(DebugError::InvalidState(self.state.to_string()));
        }
        self.state = PipelineState::Running;

        for step in &self.steps {
            let name = step.name();
            if cancel.is_cancelled() && !step.ignore_cancellation() {
                tracing::info!(step = name, "pipeline cancelled");
                self.state = PipelineState::Cancelled;
                return Ok(PipelineOutcome::Cancelled);
            }

            let visible = !step.hidden();
            if visible {
                emitter.step_started(name);
            }
            tracing::debug!(step = name, "running step");

            match step.execute(context, emitter, cancel).await {
                Ok(()) => {
                    if visible {
                        emitter.step_finished(name, &StepOutcome::Succeeded);
                    }
                }
                Err(e) if e.is_cancelled() => {
                    tracing::info!(step = name, "step cancelled");
                    if visible {
                        emitter.step_finished(name, &StepOutcome::Cancelled);
                    }
                    self.state = PipelineState::Cancelled;
                    return Ok(PipelineOutcome::Cancelled);
                }
                Err(e) => {
                    let message = e.to_string();
                    emitter.emit(&message, true);
                    if visible {
                        emitter.step_finished(name, &StepOutcome::Failed(message));
                    }
                    self.state = PipelineState::Failed;
                    return Err(DebugError::step(name, e));
                }
            }
        }

        self.state = PipelineState::Completed;
        Ok(PipelineOutcome::Completed)
    }
}
