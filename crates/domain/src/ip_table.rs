use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use splittun_net::CoarseClock;

use crate::matcher::DomainAction;

const MIN_TTL_SECS: u64 = 60;
const MAX_TTL_SECS: u64 = 3600;
const CLEAN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DomainIpEntry {
    pub tunnel_id: String,
    pub action: DomainAction,
    pub domain: String,
    pub expires_at: u64,
}

pub type DirectHook = Box<dyn Fn(Ipv4Addr) + Send + Sync>;

/// Destination-IP routing hints populated from answered A records of
/// matched domain rules.
pub struct DomainIpTable {
    entries: RwLock<HashMap<Ipv4Addr, DomainIpEntry>>,
    clock: CoarseClock,
    direct_insert: RwLock<Option<DirectHook>>,
    direct_evict: RwLock<Option<DirectHook>>,
}

impl DomainIpTable {
    pub fn new(clock: CoarseClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            direct_insert: RwLock::new(None),
            direct_evict: RwLock::new(None),
        }
    }

    /// `on_insert` fires when a `Direct` entry lands so the host filter can
    /// permit the IP; `on_evict` fires on expiry so the permit is dropped.
    pub fn set_direct_hooks(&self, on_insert: DirectHook, on_evict: DirectHook) {
        *self.direct_insert.write() = Some(on_insert);
        *self.direct_evict.write() = Some(on_evict);
    }

    pub fn insert(
        &self,
        ip: Ipv4Addr,
        tunnel_id: String,
        action: DomainAction,
        domain: String,
        ttl_secs: u64,
    ) {
        let ttl = ttl_secs.clamp(MIN_TTL_SECS, MAX_TTL_SECS);
        let entry = DomainIpEntry {
            tunnel_id,
            action,
            domain,
            expires_at: self.clock.now() + ttl,
        };
        let previous = self.entries.write().insert(ip, entry);
        if action == DomainAction::Direct
            && previous.is_none_or(|p| p.action != DomainAction::Direct)
            && let Some(hook) = self.direct_insert.read().as_ref()
        {
            hook(ip);
        }
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<DomainIpEntry> {
        let entries = self.entries.read();
        let entry = entries.get(&ip)?;
        if entry.expires_at <= self.clock.now() {
            return None;
        }
        Some(entry.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn sweep(&self) {
        let now = self.clock.now();
        let expired: Vec<(Ipv4Addr, DomainAction)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(ip, e)| (*ip, e.action))
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        let callback = self.direct_evict.read();
        for (ip, action) in &expired {
            if entries
                .get(ip)
                .is_some_and(|e| e.expires_at <= now)
            {
                entries.remove(ip);
                if *action == DomainAction::Direct
                    && let Some(cb) = callback.as_ref()
                {
                    cb(*ip);
                }
            }
        }
        debug!(evicted = expired.len(), "domain-ip table sweep");
    }

    pub async fn run_cleanup(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(CLEAN_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.sweep(),
            }
        }
    }
}
