use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use parking_lot::RwLock;
use tracing::info;

use crate::bus::{Event, EventBus};
use crate::provider::{TunnelProvider, TunnelState};

struct Status {
    state: TunnelState,
    last_error: Option<String>,
}

/// One registered tunnel. Proxy ports are assigned at registration and
/// immutable afterwards.
pub struct TunnelEntry {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub provider: Arc<dyn TunnelProvider>,
    status: RwLock<Status>,
}

impl TunnelEntry {
    pub fn new(
        id: String,
        name: String,
        protocol: String,
        tcp_port: u16,
        udp_port: u16,
        provider: Arc<dyn TunnelProvider>,
    ) -> Self {
        Self {
            id,
            name,
            protocol,
            tcp_port,
            udp_port,
            provider,
            status: RwLock::new(Status {
                state: TunnelState::Down,
                last_error: None,
            }),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.status.read().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.read().last_error.clone()
    }

    pub fn is_up(&self) -> bool {
        self.state() == TunnelState::Up
    }
}

pub struct TunnelRegistry {
    entries: RwLock<HashMap<String, Arc<TunnelEntry>>>,
    bus: Arc<EventBus>,
}

impl TunnelRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn register(&self, entry: TunnelEntry) -> Result<Arc<TunnelEntry>> {
        let mut entries = self.entries.write();
        if entries.contains_key(&entry.id) {
            return Err(anyhow!("duplicate tunnel id: {}", entry.id));
        }
        info!(id = %entry.id, protocol = %entry.protocol, tcp_port = entry.tcp_port, udp_port = entry.udp_port, "tunnel registered");
        let entry = Arc::new(entry);
        entries.insert(entry.id.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<TunnelEntry>> {
        self.entries.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TunnelEntry>> {
        self.entries.read().get(id).cloned()
    }

    pub fn entries(&self) -> Vec<Arc<TunnelEntry>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn set_state(&self, id: &str, state: TunnelState, error: Option<String>) {
        let Some(entry) = self.get(id) else {
            return;
        };
        {
            let mut status = entry.status.write();
            if status.state == state && status.last_error == error {
                return;
            }
            status.state = state;
            status.last_error = error.clone();
        }
        self.bus.publish(Event::TunnelStateChanged {
            id: id.to_string(),
            state,
            error,
        });
    }

    pub fn is_up(&self, id: &str) -> bool {
        self.get(id).is_some_and(|e| e.is_up())
    }

    /// First Up tunnel exposing a raw forwarder, in no particular order.
    pub fn any_up_raw(&self) -> Option<Arc<TunnelEntry>> {
        self.entries
            .read()
            .values()
            .find(|e| e.is_up() && e.provider.raw_forwarder().is_some())
            .cloned()
    }
}
