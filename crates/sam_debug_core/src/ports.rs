use std::net::{IpAddr, Ipv4Addr, TcpListener};

use serde::{Deserialize, Serialize};

use crate::{DebugError, Result};

/// Ports reserved for one debug session.
///
/// `frontend` carries the RPC handshake with the debugger worker, `backend`
/// the worker's second leg back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DebugPorts {
    frontend: u16,
    backend: u16,
}

impl DebugPorts {
    pub fn new(frontend: u16, backend: u16) -> Self {
        Self { frontend, backend }
    }

    pub fn frontend(&self) -> u16 {
        self.frontend
    }

    pub fn backend(&self) -> u16 {
        self.backend
    }
}

/// Picks free local ports by binding ephemeral listeners.
///
/// Nothing stays reserved once `allocate` returns; another process can still
/// take a port before the debugger binds it.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    bind_address: IpAddr,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl PortAllocator {
    pub fn new(bind_address: IpAddr) -> Self {
        Self { bind_address }
    }

    /// Returns `count` distinct ports that were bindable at return time.
    pub fn allocate(&self, count: usize) -> Result<Vec<u16>> {
        // Every listener stays open until all ports are picked so the OS
        // cannot hand out the same port twice.
        let mut listeners = Vec::with_capacity(count);
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            let listener = TcpListener::bind((self.bind_address, 0)).map_err(|e| {
                DebugError::PortAllocation(format!("bind on {} failed: {e}", self.bind_address))
            })?;
            ports.push(listener.local_addr()?.port());
            listeners.push(listener);
        }
        drop(listeners);

        tracing::debug!(?ports, "allocated debugger ports");
        Ok(ports)
    }

    pub fn allocate_pair(&self) -> Result<DebugPorts> {
        match self.allocate(2)?.as_slice() {
            [frontend, backend] => Ok(DebugPorts::new(*frontend, *backend)),
            other => Err(DebugError::PortAllocation(format!(
                "expected 2 ports, got {}",
                other.len()
            ))),
        }
    }
}
