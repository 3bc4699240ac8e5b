use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use splittun_net::CoarseClock;

use crate::entry::{RawFlow, TcpNat, UdpNat};
use crate::key::{NatKey, RawKey, SHARD_COUNT, ShardKey};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Open hash table split across 64 shards, each behind its own RW lock.
pub struct ShardedTable<K, V> {
    shards: Vec<RwLock<HashMap<K, Arc<V>>>>,
}

impl<K: ShardKey + Eq + Hash + Clone, V> Default for ShardedTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ShardKey + Eq + Hash + Clone, V> ShardedTable<K, V> {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    pub fn insert(&self, key: K, value: Arc<V>) {
        self.shards[key.shard()].write().insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.shards[key.shard()].read().get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.shards[key.shard()].write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collect stale keys under the read lock, then drop them under the
    /// write lock, re-checking staleness in case of a concurrent touch.
    pub fn sweep(&self, is_stale: impl Fn(&V) -> bool, mut on_evict: impl FnMut(&K, &V)) {
        for shard in &self.shards {
            let stale: Vec<K> = shard
                .read()
                .iter()
                .filter(|(_, v)| is_stale(v))
                .map(|(k, _)| k.clone())
                .collect();
            if stale.is_empty() {
                continue;
            }
            let mut guard = shard.write();
            for key in stale {
                let still_stale = guard.get(&key).is_some_and(|v| is_stale(v));
                if still_stale
                    && let Some(v) = guard.remove(&key)
                {
                    on_evict(&key, &v);
                }
            }
        }
    }
}

pub type RawEvictHook = Box<dyn Fn(&RawKey, &RawFlow) + Send + Sync>;

/// All NAT state owned by the router: hairpinned TCP/UDP entries and raw
/// flows, plus the per-table aging loops.
pub struct FlowTable {
    pub tcp: ShardedTable<NatKey, TcpNat>,
    pub udp: ShardedTable<NatKey, UdpNat>,
    pub raw: ShardedTable<RawKey, RawFlow>,
    clock: CoarseClock,
    raw_evict_hook: RwLock<Option<RawEvictHook>>,
}

impl FlowTable {
    pub fn new(clock: CoarseClock) -> Self {
        Self {
            tcp: ShardedTable::new(),
            udp: ShardedTable::new(),
            raw: ShardedTable::new(),
            clock,
            raw_evict_hook: RwLock::new(None),
        }
    }

    pub fn clock(&self) -> &CoarseClock {
        &self.clock
    }

    /// Hook invoked for every raw flow before it is dropped, whether by
    /// aging or by explicit removal (FakeIP active-flow accounting).
    pub fn set_raw_evict_hook(&self, hook: RawEvictHook) {
        *self.raw_evict_hook.write() = Some(hook);
    }

    pub fn remove_raw(&self, key: &RawKey) -> Option<Arc<RawFlow>> {
        let removed = self.raw.remove(key)?;
        if let Some(hook) = self.raw_evict_hook.read().as_ref() {
            hook(key, &removed);
        }
        Some(removed)
    }

    pub fn sweep_tcp(&self) {
        let now = self.clock.now();
        let mut evicted = 0usize;
        self.tcp.sweep(|v| v.is_stale(now), |_, _| evicted += 1);
        if evicted > 0 {
            debug!(evicted, "tcp nat sweep");
        }
    }

    pub fn sweep_udp(&self) {
        let now = self.clock.now();
        let mut evicted = 0usize;
        self.udp.sweep(|v| v.is_stale(now), |_, _| evicted += 1);
        if evicted > 0 {
            debug!(evicted, "udp nat sweep");
        }
    }

    pub fn sweep_raw(&self) {
        let now = self.clock.now();
        let hook = self.raw_evict_hook.read();
        let mut evicted = 0usize;
        self.raw.sweep(
            |v| v.is_stale(now),
            |key, flow| {
                if let Some(hook) = hook.as_ref() {
                    hook(key, flow);
                }
                evicted += 1;
            },
        );
        if evicted > 0 {
            debug!(evicted, "raw flow sweep");
        }
    }

    pub async fn run_tcp_cleanup(self: Arc<Self>, cancel: CancellationToken) {
        run_sweeper(cancel, move || self.sweep_tcp()).await;
    }

    pub async fn run_udp_cleanup(self: Arc<Self>, cancel: CancellationToken) {
        run_sweeper(cancel, move || self.sweep_udp()).await;
    }

    pub async fn run_raw_cleanup(self: Arc<Self>, cancel: CancellationToken) {
        run_sweeper(cancel, move || self.sweep_raw()).await;
    }
}

async fn run_sweeper(cancel: CancellationToken, mut sweep: impl FnMut()) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => sweep(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{FIN_CLIENT, FIN_SERVER, TCP_IDLE_SECS};
    use splittun_rules::Priority;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tcp_entry(now: u64) -> TcpNat {
        TcpNat::new(
            Ipv4Addr::new(93, 184, 216, 34),
            443,
            "tun-a".to_string(),
            34911,
            None,
            None,
            now,
        )
    }

    #[test]
    fn insert_get_remove() {
        let table: ShardedTable<NatKey, TcpNat> = ShardedTable::new();
        let key = NatKey::new(Ipv4Addr::new(10, 255, 0, 1), 43211);
        table.insert(key, Arc::new(tcp_entry(1_000)));
        assert!(table.get(&key).is_some());
        assert!(table.remove(&key).is_some());
        assert!(table.get(&key).is_none());
    }

    #[test]
    fn sweep_reaps_idle_entries_only() {
        let clock = CoarseClock::new();
        clock.store(1_000);
        let flows = FlowTable::new(clock.clone());

        let idle = NatKey::new(Ipv4Addr::new(10, 255, 0, 1), 1);
        let fresh = NatKey::new(Ipv4Addr::new(10, 255, 0, 1), 2);
        flows.tcp.insert(idle, Arc::new(tcp_entry(1_000)));
        flows.tcp.insert(fresh, Arc::new(tcp_entry(1_000)));

        clock.store(1_000 + TCP_IDLE_SECS);
        flows.tcp.get(&fresh).unwrap().touch(clock.now());
        flows.sweep_tcp();
        assert!(flows.tcp.get(&idle).is_none());
        assert!(flows.tcp.get(&fresh).is_some());
    }

    #[test]
    fn both_fin_entry_reaped_after_grace() {
        let clock = CoarseClock::new();
        clock.store(1_000);
        let flows = FlowTable::new(clock.clone());

        let key = NatKey::new(Ipv4Addr::new(10, 255, 0, 1), 3);
        let entry = Arc::new(tcp_entry(1_000));
        flows.tcp.insert(key, Arc::clone(&entry));
        entry.mark_fin(FIN_CLIENT, 1_000);
        entry.mark_fin(FIN_SERVER, 1_000);

        clock.store(1_003);
        flows.sweep_tcp();
        assert!(flows.tcp.get(&key).is_none());
    }

    #[test]
    fn raw_evict_hook_fires_on_sweep_and_remove() {
        let clock = CoarseClock::new();
        clock.store(1_000);
        let flows = FlowTable::new(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        flows.set_raw_evict_hook(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let dst = Ipv4Addr::new(93, 184, 216, 34);
        let swept = RawKey::new(splittun_net::Proto::Tcp, dst, 443);
        let removed = RawKey::new(splittun_net::Proto::Udp, dst, 4000);
        let flow = |now| {
            Arc::new(RawFlow::new(
                "tun-a".to_string(),
                Ipv4Addr::new(10, 6, 0, 2),
                Priority::Normal,
                false,
                None,
                None,
                now,
            ))
        };
        flows.raw.insert(swept, flow(1_000));
        flows.raw.insert(removed, flow(1_000));

        flows.remove_raw(&removed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        clock.store(1_000 + crate::entry::RAW_IDLE_SECS);
        flows.sweep_raw();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(flows.raw.is_empty());
    }
}
