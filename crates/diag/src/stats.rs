use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct TunnelStats {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

impl TunnelStats {
    pub fn add_tx(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rx(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn tx(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
}

/// Per-tunnel byte counters plus the periodic reporter.
#[derive(Default)]
pub struct StatsRegistry {
    tunnels: RwLock<HashMap<String, Arc<TunnelStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tunnel(&self, id: &str) -> Arc<TunnelStats> {
        if let Some(stats) = self.tunnels.read().get(id) {
            return Arc::clone(stats);
        }
        let mut tunnels = self.tunnels.write();
        Arc::clone(tunnels.entry(id.to_string()).or_default())
    }

    pub fn snapshot(&self) -> Vec<(String, u64, u64)> {
        self.tunnels
            .read()
            .iter()
            .map(|(id, s)| (id.clone(), s.tx(), s.rx()))
            .collect()
    }

    pub async fn run_reporter(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        ticker.tick().await;
        let mut last: HashMap<String, (u64, u64)> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    for (id, tx, rx) in self.snapshot() {
                        let (ptx, prx) = last.get(&id).copied().unwrap_or((0, 0));
                        if tx != ptx || rx != prx {
                            info!(tunnel = %id, tx_bytes = tx, rx_bytes = rx, "tunnel throughput");
                        }
                        last.insert(id, (tx, rx));
                    }
                }
            }
        }
    }
}

/// Counter for TUN write drops; logs at 1, 10 000, 20 000, ... to avoid
/// flooding when the ring stays full.
#[derive(Debug, Default)]
pub struct DropCounter {
    count: AtomicU64,
}

impl DropCounter {
    pub fn increment(&self, what: &str) {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n % 10_000 == 0 {
            warn!(dropped = n, "{what}");
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Accumulated slow-path timings (classification, hairpin setup).
#[derive(Debug, Default)]
pub struct SlowPathTimer {
    total_micros: AtomicU64,
    samples: AtomicU64,
}

impl SlowPathTimer {
    pub fn observe(&self, elapsed: Duration) {
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn average_micros(&self) -> u64 {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0;
        }
        self.total_micros.load(Ordering::Relaxed) / samples
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}
