use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use splittun_domain::{DomainAction, DomainIpTable, DomainTarget, FakeIpPool, MatcherHandle};
use splittun_tunnel::{DIRECT_ID, DialError, TunnelProvider, TunnelRegistry};

use crate::cache::{CacheKey, DnsCache};
use crate::wire;

/// Hard-coded raw fallback when no upstreams are configured.
pub const LAST_RESORT_SERVERS: [Ipv4Addr; 2] =
    [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)];

const UDP_CONCURRENCY: usize = 200;
const TCP_CONCURRENCY: usize = 100;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub listen: SocketAddrV4,
    pub servers: Vec<Ipv4Addr>,
    pub tunnel_ids: Vec<String>,
    pub timeout: Duration,
    pub fallback_direct: bool,
    /// Upstream port; fixed at 53 outside tests.
    pub upstream_port: u16,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 53),
            servers: Vec::new(),
            tunnel_ids: Vec::new(),
            timeout: Duration::from_secs(3),
            fallback_direct: true,
            upstream_port: 53,
        }
    }
}

#[derive(Debug, Default)]
pub struct DnsCounters {
    pub aaaa_suppressed: AtomicU64,
    pub blocked: AtomicU64,
    pub servfail: AtomicU64,
}

/// Local DNS interceptor: UDP+TCP listeners on the TUN address, cache,
/// matcher-driven blocking, FakeIP synthesis, and the upstream fan-out.
pub struct DnsService {
    cfg: ResolverConfig,
    cache: DnsCache,
    matcher: Arc<MatcherHandle>,
    ip_table: Arc<DomainIpTable>,
    fakeip: Option<Arc<FakeIpPool>>,
    registry: Arc<TunnelRegistry>,
    counters: DnsCounters,
}

impl DnsService {
    pub fn new(
        cfg: ResolverConfig,
        cache: DnsCache,
        matcher: Arc<MatcherHandle>,
        ip_table: Arc<DomainIpTable>,
        fakeip: Option<Arc<FakeIpPool>>,
        registry: Arc<TunnelRegistry>,
    ) -> Self {
        Self {
            cfg,
            cache,
            matcher,
            ip_table,
            fakeip,
            registry,
            counters: DnsCounters::default(),
        }
    }

    pub fn counters(&self) -> &DnsCounters {
        &self.counters
    }

    /// Answer one query. `None` means the message was unparseable and is
    /// dropped without a reply.
    pub async fn resolve(&self, query: &[u8]) -> Option<Vec<u8>> {
        let q = wire::parse_question(query).ok()?;

        if q.qtype == wire::QTYPE_AAAA {
            self.counters.aaaa_suppressed.fetch_add(1, Ordering::Relaxed);
            return wire::empty_response(query, wire::RCODE_NOERROR);
        }

        let matched: Option<DomainTarget> = self.matcher.load().lookup(&q.name).cloned();
        if let Some(target) = &matched
            && target.action == DomainAction::Block
        {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
            debug!(name = %q.name, "domain blocked, synthesizing nxdomain");
            return wire::empty_response(query, wire::RCODE_NXDOMAIN);
        }

        let key = CacheKey {
            name: q.name.clone(),
            qtype: q.qtype,
            qclass: q.qclass,
        };
        if let Some(hit) = self.cache.get(&key, q.id) {
            return Some(self.finalize(query, &q, hit, matched.as_ref()));
        }

        match self.forward(query).await {
            Ok(mut resp) => {
                wire::set_txid(&mut resp, q.id);
                self.cache.put(key, &resp);
                Some(self.finalize(query, &q, resp, matched.as_ref()))
            }
            Err(err) => {
                self.counters.servfail.fetch_add(1, Ordering::Relaxed);
                warn!(name = %q.name, %err, "all dns upstreams failed");
                wire::empty_response(query, wire::RCODE_SERVFAIL)
            }
        }
    }

    /// Record matched A answers into the domain-IP table and, with FakeIP
    /// enabled, swap the answer for the domain's synthetic address.
    fn finalize(
        &self,
        query: &[u8],
        q: &wire::Question,
        resp: Vec<u8>,
        matched: Option<&DomainTarget>,
    ) -> Vec<u8> {
        let Some(target) = matched else {
            return resp;
        };
        if q.qtype != wire::QTYPE_A {
            return resp;
        }
        let Ok(resp_q) = wire::parse_question(&resp) else {
            return resp;
        };
        let records = wire::a_records(&resp, resp_q.rr_offset);
        if records.is_empty() {
            return resp;
        }

        let (route_id, action) = match target.action {
            DomainAction::Direct => (DIRECT_ID.to_string(), DomainAction::Direct),
            _ => (target.tunnel_id.clone(), DomainAction::Route),
        };
        for (ip, ttl) in &records {
            self.ip_table.insert(
                *ip,
                route_id.clone(),
                action,
                q.name.clone(),
                u64::from(*ttl),
            );
        }

        if let Some(pool) = &self.fakeip {
            let min_ttl = records.iter().map(|r| r.1).min().unwrap_or(60).max(1);
            let real: Vec<Ipv4Addr> = records.iter().map(|r| r.0).collect();
            match pool.alloc(&q.name, real, route_id, action) {
                Ok(fake) => {
                    if let Some(fake_resp) = wire::a_response(query, &[fake], min_ttl) {
                        return fake_resp;
                    }
                }
                // Reply with the real answer when the pool is pinned full.
                Err(err) => warn!(name = %q.name, %err, "fakeip allocation failed"),
            }
        }
        resp
    }

    async fn forward(&self, query: &[u8]) -> Result<Vec<u8>> {
        // Tunnel fan-out: every configured tunnel times every configured
        // upstream, first success cancels the rest.
        if !self.cfg.servers.is_empty() {
            let mut attempts = FuturesUnordered::new();
            for id in &self.cfg.tunnel_ids {
                let Some(entry) = self.registry.get(id) else {
                    continue;
                };
                if !entry.is_up() {
                    continue;
                }
                for server in &self.cfg.servers {
                    let provider = Arc::clone(&entry.provider);
                    let target = SocketAddrV4::new(*server, self.cfg.upstream_port);
                    let query = query.to_vec();
                    let timeout = self.cfg.timeout;
                    attempts.push(async move {
                        query_provider(provider, target, &query, timeout).await
                    });
                }
            }
            let fanout = async {
                while let Some(result) = attempts.next().await {
                    match result {
                        Ok(resp) => return Some(resp),
                        Err(err) => debug!(%err, "dns upstream attempt failed"),
                    }
                }
                None
            };
            if let Ok(Some(resp)) = tokio::time::timeout(self.cfg.timeout, fanout).await {
                return Ok(resp);
            }

            if self.cfg.fallback_direct
                && let Some(direct) = self.registry.get(DIRECT_ID)
            {
                for server in &self.cfg.servers {
                    let target = SocketAddrV4::new(*server, self.cfg.upstream_port);
                    if let Ok(resp) = query_provider(
                        Arc::clone(&direct.provider),
                        target,
                        query,
                        self.cfg.timeout,
                    )
                    .await
                    {
                        return Ok(resp);
                    }
                }
            }
        }

        // Last resort: plain sockets through the host stack, so the
        // resolver keeps answering with every tunnel down.
        let raw_servers: Vec<Ipv4Addr> = if self.cfg.servers.is_empty() {
            LAST_RESORT_SERVERS.to_vec()
        } else {
            self.cfg.servers.clone()
        };
        for server in raw_servers {
            let target = SocketAddrV4::new(server, self.cfg.upstream_port);
            match raw_query(target, query, self.cfg.timeout).await {
                Ok(resp) => return Ok(resp),
                Err(err) => debug!(%server, %err, "raw dns fallback failed"),
            }
        }
        Err(anyhow!("no dns upstream answered"))
    }

    pub async fn run_udp(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let socket = Arc::new(
            UdpSocket::bind(self.cfg.listen)
                .await
                .with_context(|| format!("failed to bind dns udp {}", self.cfg.listen))?,
        );
        info!(listen = %self.cfg.listen, "dns udp listener up");
        let semaphore = Arc::new(Semaphore::new(UDP_CONCURRENCY));
        let mut buf = vec![0u8; wire::MAX_UDP_PAYLOAD];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                recv = socket.recv_from(&mut buf) => {
                    let (n, peer) = recv?;
                    // Over the handler limit the datagram is dropped; the
                    // client retransmits.
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        continue;
                    };
                    let query = buf[..n].to_vec();
                    let service = Arc::clone(&self);
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Some(resp) = service.resolve(&query).await {
                            let _ = socket.send_to(&resp, peer).await;
                        }
                    });
                }
            }
        }
    }

    pub async fn run_tcp(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.cfg.listen)
            .await
            .with_context(|| format!("failed to bind dns tcp {}", self.cfg.listen))?;
        info!(listen = %self.cfg.listen, "dns tcp listener up");
        let semaphore = Arc::new(Semaphore::new(TCP_CONCURRENCY));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        continue;
                    };
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _ = service.serve_tcp_conn(stream).await;
                    });
                }
            }
        }
    }

    async fn serve_tcp_conn(&self, mut stream: tokio::net::TcpStream) -> Result<()> {
        loop {
            let mut len_buf = [0u8; 2];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return Ok(());
            }
            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut query = vec![0u8; len];
            stream.read_exact(&mut query).await?;
            let Some(resp) = self.resolve(&query).await else {
                continue;
            };
            stream
                .write_all(&(resp.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&resp).await?;
        }
    }
}

async fn query_provider(
    provider: Arc<dyn TunnelProvider>,
    target: SocketAddrV4,
    query: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let attempt = async {
        match provider.dial_udp(target).await {
            Ok(conn) => {
                conn.send(query).await?;
                let mut buf = vec![0u8; wire::MAX_UDP_PAYLOAD];
                let n = conn.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
            // RFC 1035 4.2.2: carry the query over TCP instead.
            Err(DialError::UdpNotSupported) => query_provider_tcp(&*provider, target, query).await,
            Err(err) => Err(err.into()),
        }
    };
    let resp: Vec<u8> = tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| anyhow!("dns upstream {target} timed out"))??;
    validate_response(query, &resp)?;
    Ok(resp)
}

async fn query_provider_tcp(
    provider: &dyn TunnelProvider,
    target: SocketAddrV4,
    query: &[u8],
) -> Result<Vec<u8>> {
    let mut stream = provider.dial_tcp(target).await?;
    stream
        .write_all(&(query.len() as u16).to_be_bytes())
        .await?;
    stream.write_all(query).await?;
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    let mut resp = vec![0u8; len];
    stream.read_exact(&mut resp).await?;
    Ok(resp)
}

async fn raw_query(target: SocketAddrV4, query: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    socket.send(query).await?;
    let mut buf = vec![0u8; wire::MAX_UDP_PAYLOAD];
    let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| anyhow!("raw dns upstream {target} timed out"))??;
    buf.truncate(n);
    validate_response(query, &buf)?;
    Ok(buf)
}

fn validate_response(query: &[u8], resp: &[u8]) -> Result<()> {
    if resp.len() < wire::HEADER_LEN {
        return Err(anyhow!("short dns response"));
    }
    if wire::txid(resp) != wire::txid(query) {
        return Err(anyhow!("dns transaction id mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::wire::testutil::build_query;
    use async_trait::async_trait;
    use splittun_domain::{DomainMatcher, DomainRuleSpec};
    use splittun_net::CoarseClock;
    use splittun_tunnel::{
        DatagramConn, DirectProvider, EventBus, ProxyStream, TunnelEntry, TunnelState,
    };

    /// Provider whose "upstream" is an in-memory DNS server with a fixed
    /// delay per server address.
    struct MockProvider {
        delays: Vec<(Ipv4Addr, Duration)>,
        udp_supported: bool,
    }

    struct MockDatagram {
        delay: Duration,
        reply: parking_lot::Mutex<Option<Vec<u8>>>,
        sent: parking_lot::Mutex<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl DatagramConn for MockDatagram {
        async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
            let query = buf.to_vec();
            let mut addrs = Vec::new();
            addrs.push((Ipv4Addr::new(93, 184, 216, 34), 300u32));
            *self.reply.lock() = Some(crate::wire::testutil::build_a_reply(&query, &addrs));
            *self.sent.lock() = Some(query);
            Ok(buf.len())
        }

        async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            tokio::time::sleep(self.delay).await;
            let reply = self.reply.lock().take().unwrap_or_default();
            let n = reply.len().min(buf.len());
            buf[..n].copy_from_slice(&reply[..n]);
            Ok(n)
        }
    }

    #[async_trait]
    impl TunnelProvider for MockProvider {
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
            Err(DialError::Other("tcp not mocked".to_string()))
        }
        async fn dial_udp(
            &self,
            target: SocketAddrV4,
        ) -> Result<Box<dyn DatagramConn>, DialError> {
            if !self.udp_supported {
                return Err(DialError::UdpNotSupported);
            }
            let delay = self
                .delays
                .iter()
                .find(|(ip, _)| *ip == *target.ip())
                .map(|(_, d)| *d)
                .unwrap_or(Duration::from_millis(80));
            Ok(Box::new(MockDatagram {
                delay,
                reply: parking_lot::Mutex::new(None),
                sent: parking_lot::Mutex::new(None),
            }))
        }
        fn name(&self) -> &str {
            "mock"
        }
        fn protocol(&self) -> &str {
            "mock"
        }
    }

    struct Fixture {
        service: Arc<DnsService>,
        clock: CoarseClock,
    }

    fn fixture(
        rules: Vec<DomainRuleSpec>,
        fakeip: Option<Arc<FakeIpPool>>,
        servers: Vec<Ipv4Addr>,
        tunnels: Vec<(&str, MockProvider)>,
    ) -> Fixture {
        let clock = CoarseClock::new();
        clock.store(1_000);
        let registry = Arc::new(TunnelRegistry::new(Arc::new(EventBus::new())));
        let mut tunnel_ids = Vec::new();
        for (id, provider) in tunnels {
            registry
                .register(TunnelEntry::new(
                    id.to_string(),
                    id.to_string(),
                    "mock".to_string(),
                    0,
                    0,
                    Arc::new(provider),
                ))
                .unwrap();
            registry.set_state(id, TunnelState::Up, None);
            tunnel_ids.push(id.to_string());
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

        let cfg = ResolverConfig {
            listen: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            servers,
            tunnel_ids,
            timeout: Duration::from_millis(500),
            fallback_direct: false,
            upstream_port: 53,
        };
        let service = DnsService::new(
            cfg,
            DnsCache::new(CacheConfig::default(), clock.clone()),
            Arc::new(MatcherHandle::new(DomainMatcher::build(rules).unwrap())),
            Arc::new(DomainIpTable::new(clock.clone())),
            fakeip,
            registry,
        );
        Fixture {
            service: Arc::new(service),
            clock,
        }
    }

    #[tokio::test]
    async fn aaaa_is_suppressed_without_upstream_traffic() {
        let f = fixture(vec![], None, vec![], vec![]);
        let query = build_query(0x42, "example.com", wire::QTYPE_AAAA);
        let resp = f.service.resolve(&query).await.unwrap();
        assert_eq!(wire::txid(&resp), Some(0x42));
        assert_eq!(wire::rcode(&resp), wire::RCODE_NOERROR);
        assert_eq!(wire::ancount(&resp), 0);
        let q = wire::parse_question(&resp).unwrap();
        assert_eq!(q.name, "example.com");
        assert_eq!(
            f.service.counters().aaaa_suppressed.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn blocked_domain_returns_nxdomain() {
        let f = fixture(
            vec![DomainRuleSpec {
                pattern: "domain:blocked.example".to_string(),
                target: DomainTarget {
                    action: DomainAction::Block,
                    tunnel_id: String::new(),
                },
            }],
            None,
            vec![],
            vec![],
        );
        let query = build_query(1, "blocked.example", wire::QTYPE_A);
        let resp = f.service.resolve(&query).await.unwrap();
        assert_eq!(wire::rcode(&resp), wire::RCODE_NXDOMAIN);
    }

    #[tokio::test]
    async fn fanout_returns_fastest_upstream_and_caches() {
        let fast = Ipv4Addr::new(1, 1, 1, 1);
        let slow = Ipv4Addr::new(8, 8, 8, 8);
        let f = fixture(
            vec![],
            None,
            vec![fast, slow],
            vec![
                (
                    "tun-a",
                    MockProvider {
                        delays: vec![
                            (fast, Duration::from_millis(20)),
                            (slow, Duration::from_millis(80)),
                        ],
                        udp_supported: true,
                    },
                ),
                (
                    "tun-b",
                    MockProvider {
                        delays: vec![
                            (fast, Duration::from_millis(80)),
                            (slow, Duration::from_millis(80)),
                        ],
                        udp_supported: true,
                    },
                ),
            ],
        );

        let query = build_query(0x7777, "example.com", wire::QTYPE_A);
        let started = std::time::Instant::now();
        let resp = f.service.resolve(&query).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(70));
        assert_eq!(wire::txid(&resp), Some(0x7777));
        let q = wire::parse_question(&resp).unwrap();
        assert!(!wire::a_records(&resp, q.rr_offset).is_empty());
        assert_eq!(f.service.cache.len(), 1);

        // Cache now serves without upstream help.
        f.clock.store(1_001);
        let again = f.service.resolve(&query).await.unwrap();
        assert_eq!(wire::txid(&again), Some(0x7777));
    }

    #[tokio::test]
    async fn servfail_when_everything_is_down() {
        // One unroutable server, no tunnels, no fallback; the raw path
        // targets the same dead server.
        let f = fixture(vec![], None, vec![Ipv4Addr::new(192, 0, 2, 1)], vec![]);
        let query = build_query(5, "example.com", wire::QTYPE_A);
        let resp = f.service.resolve(&query).await.unwrap();
        assert_eq!(wire::rcode(&resp), wire::RCODE_SERVFAIL);
        assert_eq!(f.service.counters().servfail.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn matched_route_records_domain_ip_table() {
        let fast = Ipv4Addr::new(1, 1, 1, 1);
        let f = fixture(
            vec![DomainRuleSpec {
                pattern: "full:example.com".to_string(),
                target: DomainTarget {
                    action: DomainAction::Route,
                    tunnel_id: "tun-a".to_string(),
                },
            }],
            None,
            vec![fast],
            vec![(
                "tun-a",
                MockProvider {
                    delays: vec![(fast, Duration::from_millis(5))],
                    udp_supported: true,
                },
            )],
        );
        let query = build_query(1, "example.com", wire::QTYPE_A);
        f.service.resolve(&query).await.unwrap();
        let entry = f
            .service
            .ip_table
            .get(Ipv4Addr::new(93, 184, 216, 34))
            .unwrap();
        assert_eq!(entry.tunnel_id, "tun-a");
        assert_eq!(entry.action, DomainAction::Route);
        assert_eq!(entry.domain, "example.com");
    }

    #[tokio::test]
    async fn fakeip_answers_are_stable_across_queries() {
        let fast = Ipv4Addr::new(1, 1, 1, 1);
        let pool = Arc::new(FakeIpPool::new(Ipv4Addr::new(198, 18, 0, 0), 15).unwrap());
        let f = fixture(
            vec![DomainRuleSpec {
                pattern: "full:example.com".to_string(),
                target: DomainTarget {
                    action: DomainAction::Route,
                    tunnel_id: "tun-a".to_string(),
                },
            }],
            Some(Arc::clone(&pool)),
            vec![fast],
            vec![(
                "tun-a",
                MockProvider {
                    delays: vec![(fast, Duration::from_millis(5))],
                    udp_supported: true,
                },
            )],
        );

        let q1 = build_query(1, "example.com", wire::QTYPE_A);
        let r1 = f.service.resolve(&q1).await.unwrap();
        let parsed = wire::parse_question(&r1).unwrap();
        let recs1 = wire::a_records(&r1, parsed.rr_offset);
        assert_eq!(recs1.len(), 1);
        let fake = recs1[0].0;
        assert!(pool.in_range(fake));

        // Second query (cache hit path) returns the same synthetic IP.
        let q2 = build_query(2, "example.com", wire::QTYPE_A);
        let r2 = f.service.resolve(&q2).await.unwrap();
        let parsed2 = wire::parse_question(&r2).unwrap();
        assert_eq!(wire::a_records(&r2, parsed2.rr_offset)[0].0, fake);

        // The pool can map the synthetic IP back to real addresses.
        let view = pool.lookup(fake).unwrap();
        assert_eq!(view.tunnel_id, "tun-a");
        assert_eq!(view.real_ips, vec![Ipv4Addr::new(93, 184, 216, 34)]);
    }
}
