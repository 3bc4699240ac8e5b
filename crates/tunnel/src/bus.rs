use std::sync::Arc;

use parking_lot::RwLock;

use crate::provider::TunnelState;

/// Published on every tunnel state transition.
#[derive(Debug, Clone)]
pub enum Event {
    TunnelStateChanged {
        id: String,
        state: TunnelState,
        error: Option<String>,
    },
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Tunnel-state pub/sub. Publishing copies the handler vector under the
/// read lock and invokes outside it, so a handler can subscribe or publish
/// without deadlocking.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Handler) {
        self.handlers.write().push(handler);
    }

    pub fn publish(&self, event: Event) {
        let handlers: Vec<Handler> = self.handlers.read().to_vec();
        for handler in handlers {
            handler(&event);
        }
    }
}
