use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use splittun_diag::TunnelStats;
use splittun_flow::NatKey;
use splittun_domain::DomainAction;
use splittun_rules::Fallback;
use splittun_tunnel::{DIRECT_ID, PrefixedStream, ProxyStream};
use splittun_util::BufPool;

use crate::ProxyShared;
use crate::fallback::{dial_tcp_chain, dial_tcp_fallback};
use crate::sni::{extract_sni, looks_like_tls};

const SNI_PEEK_MAX: usize = 16 * 1024;
const SNI_PEEK_WAIT: Duration = Duration::from_millis(500);
const INITIAL_READ_MAX: usize = 32 * 1024;
const INITIAL_READ_WAIT: Duration = Duration::from_secs(2);
const FIRST_BYTE_WAIT: Duration = Duration::from_secs(3);
const SOCKET_BUF_BYTES: usize = 2 * 1024 * 1024;

/// Per-tunnel transparent TCP proxy. Hairpinned connections land here; the
/// NAT entry keyed by the peer address carries the original destination.
pub struct TcpProxy {
    listener: TcpListener,
    shared: Arc<ProxyShared>,
}

impl TcpProxy {
    pub fn new(listener: TcpListener, shared: Arc<ProxyShared>) -> Self {
        Self { listener, shared }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    let Ok((stream, peer)) = accepted else {
                        break;
                    };
                    tune_socket(&stream);
                    let shared = Arc::clone(&self.shared);
                    let conn_cancel = cancel.clone();
                    tracker.spawn(async move {
                        tokio::select! {
                            _ = conn_cancel.cancelled() => {}
                            _ = handle_conn(shared, stream, peer) => {}
                        }
                    });
                }
            }
        }
        tracker.close();
        tracker.wait().await;
    }
}

async fn handle_conn(shared: Arc<ProxyShared>, mut stream: TcpStream, peer: SocketAddr) {
    let SocketAddr::V4(peer) = peer else {
        return;
    };
    let key = NatKey::new(*peer.ip(), peer.port());
    let Some(nat) = shared.flows.tcp.get(&key) else {
        debug!(%peer, "tcp connection without nat entry");
        return;
    };
    nat.touch(shared.flows.clock().now());

    let mut tunnel_id = nat.tunnel_id.clone();
    let mut dst_ip = nat.resolved_dst.unwrap_or(nat.orig_dst);
    if nat.resolved_dst.is_none()
        && let Some(pool) = &shared.fakeip
        && pool.in_range(nat.orig_dst)
        && let Some(view) = pool.lookup(nat.orig_dst)
        && let Some(real) = view.real_ips.first()
    {
        dst_ip = *real;
    }
    let target = SocketAddrV4::new(dst_ip, nat.orig_dst_port);

    // SNI peek: the hostname may override the routing decision.
    let mut initial = Vec::new();
    if shared.sni_enabled {
        initial = peek_client_hello(&mut stream).await;
        if let Some(host) = extract_sni(&initial)
            && let Some(target_match) = shared.matcher.load().lookup(&host)
        {
            match target_match.action {
                DomainAction::Block => {
                    debug!(%host, "sni override: domain blocked, dropping connection");
                    return;
                }
                DomainAction::Direct => {
                    debug!(%host, "sni override: direct");
                    tunnel_id = DIRECT_ID.to_string();
                }
                DomainAction::Route => {
                    debug!(%host, tunnel = %target_match.tunnel_id, "sni override: route");
                    tunnel_id = target_match.tunnel_id.clone();
                }
            }
        }
    }

    let Some(outcome) = dial_tcp_chain(&shared, &tunnel_id, target, nat.failover.as_ref()).await
    else {
        warn!(%target, tunnel = %tunnel_id, "all dial attempts failed, closing");
        return;
    };
    let mut tunnel_conn = outcome.conn;
    let mut used_tunnel = outcome.tunnel_id;

    // Early-EOF detection: a tunnel connection the server blackholes is
    // retried through the fallback path with the client bytes replayed.
    let fallback_kind = nat.failover.as_ref().map(|f| f.fallback);
    let probe = !matches!(
        fallback_kind,
        None | Some(Fallback::Block) | Some(Fallback::Drop)
    ) && used_tunnel != DIRECT_ID;
    if probe {
        if initial.is_empty() {
            let mut buf = vec![0u8; INITIAL_READ_MAX];
            if let Ok(Ok(n)) = timeout(INITIAL_READ_WAIT, stream.read(&mut buf)).await {
                buf.truncate(n);
                initial = buf;
            }
        }
        let write_failed = !initial.is_empty()
            && tunnel_conn.write_all(&initial).await.is_err();

        let mut early_eof = write_failed;
        if !early_eof {
            let mut first = vec![0u8; 16 * 1024];
            match timeout(FIRST_BYTE_WAIT, tunnel_conn.read(&mut first)).await {
                Ok(Ok(0)) | Ok(Err(_)) => early_eof = true,
                Ok(Ok(n)) => {
                    first.truncate(n);
                    tunnel_conn = Box::new(PrefixedStream::new(first, tunnel_conn));
                }
                // Server is slow but the connection looks alive.
                Err(_) => {}
            }
        }
        if early_eof {
            warn!(tunnel = %used_tunnel, %target, "early eof from tunnel, retrying via fallback");
            let Some(retry) = dial_tcp_fallback(&shared, target, nat.failover.as_ref()).await
            else {
                return;
            };
            tunnel_conn = retry.conn;
            used_tunnel = retry.tunnel_id;
            if !initial.is_empty() && tunnel_conn.write_all(&initial).await.is_err() {
                return;
            }
            info!(tunnel = %used_tunnel, %target, "early eof fallback succeeded");
        }
    } else if !initial.is_empty() && tunnel_conn.write_all(&initial).await.is_err() {
        return;
    }

    let stats = shared.stats.tunnel(&used_tunnel);
    relay(stream, tunnel_conn, stats, &shared.pool).await;
}

/// Accumulate up to 16 KB of the first client bytes within 500 ms, stopping
/// as soon as an SNI is parseable or the stream is clearly not TLS.
async fn peek_client_hello(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let start = Instant::now();
    let mut chunk = [0u8; 4096];
    while buf.len() < SNI_PEEK_MAX {
        let remaining = SNI_PEEK_WAIT.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if extract_sni(&buf).is_some() || !looks_like_tls(&buf) {
                    break;
                }
            }
            _ => break,
        }
    }
    buf
}

async fn relay(
    client: TcpStream,
    tunnel: Box<dyn ProxyStream>,
    stats: Arc<TunnelStats>,
    pool: &Arc<BufPool>,
) {
    let (client_r, client_w) = client.into_split();
    let (tunnel_r, tunnel_w) = tokio::io::split(tunnel);
    let up_stats = Arc::clone(&stats);
    let up = copy_half(client_r, tunnel_w, pool, move |n| up_stats.add_tx(n));
    let down = copy_half(tunnel_r, client_w, pool, move |n| stats.add_rx(n));
    tokio::join!(up, down);
}

async fn copy_half<R, W>(mut read: R, mut write: W, pool: &Arc<BufPool>, count: impl Fn(u64))
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.take();
    loop {
        match read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                count(n as u64);
            }
        }
    }
    // Propagate half-close so the peer's copy loop can finish cleanly.
    let _ = write.shutdown().await;
    pool.put(buf);
}

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let size: libc::c_int = SOCKET_BUF_BYTES as libc::c_int;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of_val(&size) as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of_val(&size) as libc::socklen_t,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sni::testutil::build_client_hello;
    use async_trait::async_trait;
    use splittun_diag::StatsRegistry;
    use splittun_domain::{DomainMatcher, DomainRuleSpec, DomainTarget, MatcherHandle};
    use splittun_flow::{FailoverCtx, FlowTable, TcpNat};
    use splittun_net::CoarseClock;
    use splittun_rules::{Priority, RuleSet, RulesHandle};
    use splittun_tunnel::{
        DatagramConn, DialError, DirectProvider, EventBus, TunnelEntry, TunnelProvider,
        TunnelRegistry, TunnelState,
    };
    use std::io;
    use std::net::Ipv4Addr;
    use tokio::net::TcpSocket;

    enum MockMode {
        Refuse,
        ConnectTo(SocketAddrV4),
    }

    struct MockTunnel {
        mode: MockMode,
    }

    #[async_trait]
    impl TunnelProvider for MockTunnel {
        async fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        fn adapter_ip(&self) -> Option<Ipv4Addr> {
            None
        }
        async fn dial_tcp(
            &self,
            _target: SocketAddrV4,
        ) -> Result<Box<dyn ProxyStream>, DialError> {
            match &self.mode {
                MockMode::Refuse => Err(DialError::Io(io::ErrorKind::ConnectionReset.into())),
                MockMode::ConnectTo(addr) => Ok(Box::new(TcpStream::connect(*addr).await?)),
            }
        }
        async fn dial_udp(
            &self,
            _target: SocketAddrV4,
        ) -> Result<Box<dyn DatagramConn>, DialError> {
            Err(DialError::UdpNotSupported)
        }
        fn name(&self) -> &str {
            "mock"
        }
        fn protocol(&self) -> &str {
            "mock"
        }
    }

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        }
    }

    fn make_shared(
        rules: RuleSet,
        matcher: DomainMatcher,
        sni_enabled: bool,
        tunnels: Vec<(&str, MockMode)>,
    ) -> Arc<ProxyShared> {
        let clock = CoarseClock::new();
        clock.store(1_000);
        let registry = Arc::new(TunnelRegistry::new(Arc::new(EventBus::new())));
        for (id, mode) in tunnels {
            registry
                .register(TunnelEntry::new(
                    id.to_string(),
                    id.to_string(),
                    "mock".to_string(),
                    0,
                    0,
                    Arc::new(MockTunnel { mode }),
                ))
                .unwrap();
            registry.set_state(id, TunnelState::Up, None);
        }
        registry
            .register(TunnelEntry::new(
                DIRECT_ID.to_string(),
                DIRECT_ID.to_string(),
                "direct".to_string(),
                0,
                0,
                Arc::new(DirectProvider::default()),
            ))
            .unwrap();
        registry.set_state(DIRECT_ID, TunnelState::Up, None);
        Arc::new(ProxyShared::new(
            Arc::new(FlowTable::new(clock)),
            registry,
            Arc::new(RulesHandle::new(rules)),
            Arc::new(MatcherHandle::new(matcher)),
            None,
            Arc::new(StatsRegistry::new()),
            sni_enabled,
        ))
    }

    async fn spawn_proxy(shared: Arc<ProxyShared>) -> (SocketAddrV4, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = v4(listener.local_addr().unwrap());
        let cancel = CancellationToken::new();
        tokio::spawn(TcpProxy::new(listener, shared).run(cancel.clone()));
        (addr, cancel)
    }

    /// Bind the client socket first so the NAT entry can be keyed by its
    /// address before the proxy accepts.
    async fn connect_with_nat(
        shared: &ProxyShared,
        proxy: SocketAddrV4,
        orig_dst: SocketAddrV4,
        tunnel_id: &str,
        failover: Option<FailoverCtx>,
    ) -> TcpStream {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = v4(socket.local_addr().unwrap());
        shared.flows.tcp.insert(
            NatKey::new(*local.ip(), local.port()),
            Arc::new(TcpNat::new(
                *orig_dst.ip(),
                orig_dst.port(),
                tunnel_id.to_string(),
                proxy.port(),
                failover,
                None,
                shared.flows.clock().now(),
            )),
        );
        socket.connect(SocketAddr::V4(proxy)).await.unwrap()
    }

    async fn origin_expecting(
        expected: Vec<u8>,
        reply: &'static [u8],
    ) -> (SocketAddrV4, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = v4(listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; expected.len()];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, expected);
            stream.write_all(reply).await.unwrap();
        });
        (addr, handle)
    }

    fn failover_ctx(exe: &str, index: usize, fallback: Fallback) -> FailoverCtx {
        let base = exe.rsplit('/').next().unwrap_or(exe).to_string();
        FailoverCtx {
            exe: exe.to_string(),
            base,
            rule_index: index,
            fallback,
        }
    }

    #[tokio::test]
    async fn connection_without_nat_entry_is_dropped() {
        let shared = make_shared(RuleSet::default(), DomainMatcher::empty(), false, vec![]);
        let (proxy, cancel) = spawn_proxy(Arc::clone(&shared)).await;
        let mut client = TcpStream::connect(SocketAddr::V4(proxy)).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn sni_override_routes_blocked_domain_direct() {
        let hello = build_client_hello("blocked.example");
        let (origin, origin_task) = origin_expecting(hello.clone(), b"ACK").await;

        let matcher = DomainMatcher::build([DomainRuleSpec {
            pattern: "domain:blocked.example".to_string(),
            target: DomainTarget {
                action: splittun_domain::DomainAction::Direct,
                tunnel_id: String::new(),
            },
        }])
        .unwrap();
        // tun-a refuses every dial; success proves the override went direct.
        let shared = make_shared(
            RuleSet::default(),
            matcher,
            true,
            vec![("tun-a", MockMode::Refuse)],
        );
        let (proxy, cancel) = spawn_proxy(Arc::clone(&shared)).await;

        let mut client = connect_with_nat(
            &shared,
            proxy,
            origin,
            "tun-a",
            Some(failover_ctx("c:/chrome/chrome.exe", 0, Fallback::Failover)),
        )
        .await;
        client.write_all(&hello).await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ACK");
        origin_task.await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn early_eof_falls_back_to_direct_with_replay() {
        let (origin, origin_task) = origin_expecting(b"hello-bytes".to_vec(), b"OK").await;

        // Blackhole: accepts, reads the client bytes, closes without
        // responding.
        let blackhole = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let blackhole_addr = v4(blackhole.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut stream, _) = blackhole.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
        });

        let shared = make_shared(
            RuleSet::default(),
            DomainMatcher::empty(),
            false,
            vec![("tun-a", MockMode::ConnectTo(blackhole_addr))],
        );
        let (proxy, cancel) = spawn_proxy(Arc::clone(&shared)).await;

        let mut client = connect_with_nat(
            &shared,
            proxy,
            origin,
            "tun-a",
            Some(failover_ctx("/usr/bin/app.exe", 0, Fallback::AllowDirect)),
        )
        .await;
        client.write_all(b"hello-bytes").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OK");
        origin_task.await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn failover_advances_to_next_matching_rule() {
        let (origin, origin_task) = origin_expecting(b"ping".to_vec(), b"pong").await;

        let rules = RuleSet::build([
            (
                "regex:.*/video.*".to_string(),
                "tun-a".to_string(),
                Fallback::Failover,
                Priority::Auto,
            ),
            (
                "regex:.*/video.*".to_string(),
                "tun-b".to_string(),
                Fallback::AllowDirect,
                Priority::Normal,
            ),
        ])
        .unwrap();
        let shared = make_shared(
            rules,
            DomainMatcher::empty(),
            false,
            vec![
                ("tun-a", MockMode::Refuse),
                ("tun-b", MockMode::ConnectTo(origin)),
            ],
        );
        let (proxy, cancel) = spawn_proxy(Arc::clone(&shared)).await;

        let mut client = connect_with_nat(
            &shared,
            proxy,
            origin,
            "tun-a",
            Some(failover_ctx("/usr/bin/video-app", 0, Fallback::Failover)),
        )
        .await;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        origin_task.await.unwrap();
        cancel.cancel();
    }
}
