use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::DEBUG_PORTS;
use crate::context::AttributeContext;
use crate::pipeline::{MessageEmitter, Step};
use crate::ports::PortAllocator;
use crate::Result;

/// Reserves the frontend and backend debugger ports.
pub struct AllocatePortsStep {
    allocator: PortAllocator,
}

impl AllocatePortsStep {
    pub fn new(allocator: PortAllocator) -> Self {
        Self { allocator }
    }
}

#[async_trait]
impl Step for AllocatePortsStep {
    fn name(&self) -> &str {
        "Allocate debugger ports"
    }

    fn hidden(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        context: &mut AttributeContext,
        _emitter: &dyn MessageEmitter,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let ports = self.allocator.allocate_pair()?;
        context.put_attribute(&DEBUG_PORTS, ports)
    }
}
