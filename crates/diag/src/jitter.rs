//! Per-tunnel RTT/loss sampling.
//!
//! Raw-capable tunnels get a persistent UDP probe (minimal DNS query) at a
//! 500 ms cadence; proxy-only tunnels time the TCP dial every 2 s. A 10 s
//! reporter emits average, jitter (max-min) and loss fraction.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use splittun_tunnel::{DatagramConn, TunnelEntry};

const PROBE_TARGET: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
const RAW_CADENCE: Duration = Duration::from_millis(500);
const RAW_RING: usize = 120;
const PROXY_CADENCE: Duration = Duration::from_secs(2);
const PROXY_RING: usize = 30;
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(3);
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

struct SampleRing {
    samples: VecDeque<Option<Duration>>,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: Option<Duration>) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// (avg ms, jitter ms, loss fraction); None when no samples yet.
    fn stats(&self) -> Option<(f64, f64, f64)> {
        if self.samples.is_empty() {
            return None;
        }
        let rtts: Vec<f64> = self
            .samples
            .iter()
            .flatten()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        let loss = 1.0 - rtts.len() as f64 / self.samples.len() as f64;
        if rtts.is_empty() {
            return Some((0.0, 0.0, loss));
        }
        let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
        let max = rtts.iter().cloned().fold(f64::MIN, f64::max);
        let min = rtts.iter().cloned().fold(f64::MAX, f64::min);
        Some((avg, max - min, loss))
    }
}

pub struct JitterProbe {
    entry: Arc<TunnelEntry>,
}

impl JitterProbe {
    pub fn new(entry: Arc<TunnelEntry>) -> Self {
        Self { entry }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let raw = self.entry.provider.raw_forwarder().is_some();
        let (cadence, capacity) = if raw {
            (RAW_CADENCE, RAW_RING)
        } else {
            (PROXY_CADENCE, PROXY_RING)
        };
        let mut ring = SampleRing::new(capacity);
        let mut sample_tick = tokio::time::interval(cadence);
        let mut report_tick = tokio::time::interval(REPORT_INTERVAL);
        report_tick.tick().await;
        let mut conn: Option<Box<dyn DatagramConn>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sample_tick.tick() => {
                    if !self.entry.is_up() {
                        continue;
                    }
                    let sample = if raw {
                        self.sample_udp(&mut conn).await
                    } else {
                        self.sample_tcp().await
                    };
                    ring.push(sample);
                }
                _ = report_tick.tick() => {
                    if let Some((avg, jitter, loss)) = ring.stats() {
                        info!(
                            tunnel = %self.entry.id,
                            avg_ms = format!("{avg:.1}"),
                            jitter_ms = format!("{jitter:.1}"),
                            loss = format!("{loss:.2}"),
                            "tunnel latency"
                        );
                    }
                }
            }
        }
    }

    async fn sample_udp(&self, conn: &mut Option<Box<dyn DatagramConn>>) -> Option<Duration> {
        if conn.is_none() {
            match self.entry.provider.dial_udp(PROBE_TARGET).await {
                Ok(c) => *conn = Some(c),
                Err(err) => {
                    debug!(tunnel = %self.entry.id, %err, "probe dial failed");
                    tokio::time::sleep(RECONNECT_COOLDOWN).await;
                    return None;
                }
            }
        }
        let Some(c) = conn.as_ref() else {
            return None;
        };
        let query = minimal_query(rand::thread_rng().r#gen());
        let start = Instant::now();
        let attempt = async {
            c.send(&query).await?;
            let mut buf = [0u8; 512];
            c.recv(&mut buf).await
        };
        match tokio::time::timeout(SAMPLE_TIMEOUT, attempt).await {
            Ok(Ok(_)) => Some(start.elapsed()),
            _ => {
                // Connection is suspect; rebuild it on the next sample.
                *conn = None;
                None
            }
        }
    }

    async fn sample_tcp(&self) -> Option<Duration> {
        let start = Instant::now();
        match tokio::time::timeout(SAMPLE_TIMEOUT, self.entry.provider.dial_tcp(PROBE_TARGET)).await
        {
            Ok(Ok(_conn)) => Some(start.elapsed()),
            _ => None,
        }
    }
}

/// Smallest well-formed query: root name, type A, class IN.
fn minimal_query(id: u16) -> Vec<u8> {
    let mut msg = Vec::with_capacity(17);
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    msg.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    msg.extend_from_slice(&[0u8; 6]);
    msg.push(0); // root
    msg.extend_from_slice(&1u16.to_be_bytes()); // A
    msg.extend_from_slice(&1u16.to_be_bytes()); // IN
    msg
}
