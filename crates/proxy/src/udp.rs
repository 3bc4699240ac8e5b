use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use splittun_flow::NatKey;
use splittun_tunnel::DatagramConn;

use crate::ProxyShared;
use crate::fallback::dial_udp_chain;

const SESSION_IDLE_SECS: u64 = 120;
const CLEAN_INTERVAL: Duration = Duration::from_secs(30);
const DATAGRAM_MAX: usize = 65535;

struct UdpSession {
    conn: Arc<dyn DatagramConn>,
    last_activity: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Per-tunnel transparent UDP proxy. Sessions are keyed by the hairpinned
/// client (ip, port); the first datagram dials through the tunnel and
/// spawns the return task.
pub struct UdpProxy {
    socket: Arc<UdpSocket>,
    shared: Arc<ProxyShared>,
    sessions: Arc<Mutex<HashMap<(Ipv4Addr, u16), UdpSession>>>,
}

impl UdpProxy {
    pub fn new(socket: UdpSocket, shared: Arc<ProxyShared>) -> Self {
        Self {
            socket: Arc::new(socket),
            shared,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let cleaner = tokio::spawn(run_cleaner(
            Arc::clone(&self.sessions),
            Arc::clone(&self.shared),
            cancel.clone(),
        ));

        let mut buf = vec![0u8; DATAGRAM_MAX];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                recv = self.socket.recv_from(&mut buf) => {
                    let Ok((n, peer)) = recv else {
                        break;
                    };
                    let SocketAddr::V4(peer) = peer else {
                        continue;
                    };
                    self.handle_datagram(&buf[..n], peer, &cancel).await;
                }
            }
        }

        for (_, session) in self.sessions.lock().drain() {
            session.cancel.cancel();
        }
        let _ = cleaner.await;
    }

    async fn handle_datagram(&self, data: &[u8], peer: SocketAddrV4, cancel: &CancellationToken) {
        let now = self.shared.flows.clock().now();
        let session_key = (*peer.ip(), peer.port());

        let existing = {
            let sessions = self.sessions.lock();
            sessions.get(&session_key).map(|s| {
                s.last_activity.store(now, Ordering::Relaxed);
                Arc::clone(&s.conn)
            })
        };
        if let Some(conn) = existing {
            if conn.send(data).await.is_err() {
                self.evict(&session_key);
            }
            return;
        }

        let nat_key = NatKey::new(*peer.ip(), peer.port());
        let Some(nat) = self.shared.flows.udp.get(&nat_key) else {
            debug!(%peer, "udp datagram without nat entry");
            return;
        };
        nat.touch(now);

        let mut dst_ip = nat.resolved_dst.unwrap_or(nat.orig_dst);
        if nat.resolved_dst.is_none()
            && let Some(pool) = &self.shared.fakeip
            && pool.in_range(nat.orig_dst)
            && let Some(view) = pool.lookup(nat.orig_dst)
            && let Some(real) = view.real_ips.first()
        {
            dst_ip = *real;
        }
        let target = SocketAddrV4::new(dst_ip, nat.orig_dst_port);

        let Some(outcome) =
            dial_udp_chain(&self.shared, &nat.tunnel_id, target, nat.failover.as_ref()).await
        else {
            warn!(%target, tunnel = %nat.tunnel_id, "udp dial failed, dropping session");
            return;
        };
        let conn: Arc<dyn DatagramConn> = Arc::from(outcome.conn);
        let last_activity = Arc::new(AtomicU64::new(now));
        let session_cancel = cancel.child_token();

        // Return path: tunnel -> hairpinned client.
        {
            let conn = Arc::clone(&conn);
            let socket = Arc::clone(&self.socket);
            let last_activity = Arc::clone(&last_activity);
            let shared = Arc::clone(&self.shared);
            let stats = self.shared.stats.tunnel(&outcome.tunnel_id);
            let session_cancel = session_cancel.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; DATAGRAM_MAX];
                loop {
                    tokio::select! {
                        _ = session_cancel.cancelled() => return,
                        recv = conn.recv(&mut buf) => {
                            let Ok(n) = recv else {
                                return;
                            };
                            stats.add_rx(n as u64);
                            last_activity.store(shared.flows.clock().now(), Ordering::Relaxed);
                            if socket.send_to(&buf[..n], SocketAddr::V4(peer)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        let stats = self.shared.stats.tunnel(&outcome.tunnel_id);
        if conn.send(data).await.is_ok() {
            stats.add_tx(data.len() as u64);
            self.sessions.lock().insert(
                session_key,
                UdpSession {
                    conn,
                    last_activity,
                    cancel: session_cancel,
                },
            );
        } else {
            session_cancel.cancel();
        }
    }

    fn evict(&self, key: &(Ipv4Addr, u16)) {
        if let Some(session) = self.sessions.lock().remove(key) {
            session.cancel.cancel();
        }
    }
}

async fn run_cleaner(
    sessions: Arc<Mutex<HashMap<(Ipv4Addr, u16), UdpSession>>>,
    shared: Arc<ProxyShared>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(CLEAN_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let now = shared.flows.clock().now();
                let mut guard = sessions.lock();
                guard.retain(|_, session| {
                    let idle = now.saturating_sub(session.last_activity.load(Ordering::Relaxed));
                    if idle >= SESSION_IDLE_SECS {
                        session.cancel.cancel();
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }
}
