use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CONTAINER_ID, DEBUG_PORTS, TARGET_PID};
use crate::context::AttributeContext;
use crate::locator::ContainerProcessLocator;
use crate::pipeline::{MessageEmitter, Step};
use crate::Result;

/// Waits for the container publishing the frontend debugger port.
pub struct FindContainerStep {
    locator: ContainerProcessLocator,
}

impl FindContainerStep {
    pub fn new(locator: ContainerProcessLocator) -> Self {
        Self { locator }
    }
}

#[async_trait]
impl Step for FindContainerStep {
    fn name(&self) -> &str {
        "Find debug container"
    }

    async fn execute(
        &self,
        context: &mut AttributeContext,
        _emitter: &dyn MessageEmitter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ports = *context.get_required_attribute(&DEBUG_PORTS)?;
        let container = self.locator.find_container(ports.frontend(), cancel).await?;
        context.put_attribute(&CONTAINER_ID, container)
    }
}

/// Waits for the runtime process inside the container.
pub struct FindProcessStep {
    locator: ContainerProcessLocator,
    marker: String,
}

impl FindProcessStep {
    pub fn new(locator: ContainerProcessLocator, marker: impl Into<String>) -> Self {
        Self {
            locator,
            marker: marker.into(),
        }
    }
}

#[async_trait]
impl Step for FindProcessStep {
    fn name(&self) -> &str {
        "Find runtime process"
    }

    async fn execute(
        &self,
        context: &mut AttributeContext,
        _emitter: &dyn MessageEmitter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let container = context.get_required_attribute(&CONTAINER_ID)?;
        let pid = self.locator.find_process(container, &self.marker, cancel).await?;
        context.put_attribute(&TARGET_PID, pid)
    }
}
