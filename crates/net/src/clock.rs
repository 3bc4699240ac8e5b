//! Coarse shared clock for idle-timeout bookkeeping.
//!
//! Flow aging compares against timeouts of minutes; a 250 ms refresh keeps
//! the hot path at one relaxed atomic load instead of a system call per
//! packet.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct CoarseClock {
    secs: Arc<AtomicU64>,
}

impl Default for CoarseClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CoarseClock {
    pub fn new() -> Self {
        Self {
            secs: Arc::new(AtomicU64::new(unix_now())),
        }
    }

    pub fn now(&self) -> u64 {
        self.secs.load(Ordering::Relaxed)
    }

    /// Force the clock value; tests drive aging with this.
    pub fn store(&self, secs: u64) {
        self.secs.store(secs, Ordering::Relaxed);
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.secs.store(unix_now(), Ordering::Relaxed);
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
