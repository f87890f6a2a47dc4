// Bounded, mutex-guarded port lease table.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, TcpListener};
use tracing::{debug, warn};

use crate::config::Ports;
use crate::model::InstanceId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("port pool {from}..={to} is exhausted")]
    PoolExhausted { from: u16, to: u16 },
    #[error("port {0} is not leased")]
    NotLeased(u16),
}

/// A reserved port and, once spawned, the instance holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortLease {
    pub port: u16,
    pub holder: Option<InstanceId>,
}

/// Hands out the lowest free port of a configured range.
///
/// The allocator never checks whether a previous holder's process is dead: a
/// port becomes free only when the caller releases it, and callers release
/// only after the supervisor confirmed the exit.
pub struct PortAllocator {
    from: u16,
    to: u16,
    check_bindable: bool,
    leases: Mutex<BTreeMap<u16, Option<InstanceId>>>,
}

impl PortAllocator {
    pub fn new(cfg: &Ports) -> Self {
        Self {
            from: cfg.from,
            to: cfg.to,
            check_bindable: cfg.check_bindable,
            leases: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reserves the lowest free port.
    pub fn reserve(&self) -> Result<PortLease, PortError> {
        let mut leases = self.leases.lock();
        for port in self.from..=self.to {
            if leases.contains_key(&port) {
                continue;
            }
            if self.check_bindable && !Self::is_bindable(port) {
                debug!(
                    component = "ports",
                    event = "port_busy",
                    port,
                    "port is bound by a foreign process, skipping"
                );
                continue;
            }
            leases.insert(port, None);
            return Ok(PortLease { port, holder: None });
        }

        warn!(
            component = "ports",
            event = "pool_exhausted",
            from = self.from,
            to = self.to,
            "no free ports left"
        );
        Err(PortError::PoolExhausted {
            from: self.from,
            to: self.to,
        })
    }

    /// Records which instance holds a reserved port.
    pub fn assign(&self, port: u16, holder: InstanceId) -> Result<(), PortError> {
        match self.leases.lock().get_mut(&port) {
            Some(slot) => {
                *slot = Some(holder);
                Ok(())
            }
            None => Err(PortError::NotLeased(port)),
        }
    }

    /// Frees a port. The caller must have confirmed the holder is dead.
    pub fn release(&self, port: u16) -> Result<(), PortError> {
        match self.leases.lock().remove(&port) {
            Some(_) => Ok(()),
            None => Err(PortError::NotLeased(port)),
        }
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leases.lock().contains_key(&port)
    }

    /// Snapshot of all current leases, ordered by port.
    pub fn leases(&self) -> Vec<PortLease> {
        self.leases
            .lock()
            .iter()
            .map(|(&port, holder)| PortLease {
                port,
                holder: holder.clone(),
            })
            .collect()
    }

    /// Number of ports not currently leased.
    pub fn available(&self) -> usize {
        let capacity = (self.to as usize) - (self.from as usize) + 1;
        capacity - self.leases.lock().len()
    }

    fn is_bindable(port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}
