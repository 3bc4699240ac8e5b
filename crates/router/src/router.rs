use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use splittun_diag::SlowPathTimer;
use splittun_domain::{DomainIpTable, FakeIpPool, GeoIpRules};
use splittun_flow::{
    FIN_CLIENT, FIN_SERVER, FlowTable, NatKey, PortSet, RawFlow, RawKey, TcpNat, UdpNat,
    VpnIpMap,
};
use splittun_hostfilter::HostFilter;
use splittun_net::packet::{self, MAX_PACKET, TCP_ACK, TCP_FIN, TCP_RST, TCP_SYN};
use splittun_net::{PacketMeta, Proto};
use splittun_rules::{IpFilter, Priority, ProcessIndex, RulesHandle};
use splittun_tunnel::{DIRECT_ID, InboundHandler, TunnelEntry, TunnelRegistry};

use crate::classify::FlowVerdict;
use crate::qos;
use crate::writer::TunWriterHandle;

/// Read half of the TUN adapter: blocks until a full IPv4 frame arrives.
#[async_trait]
pub trait TunAdapter: Send {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

pub struct RouterParams {
    pub flows: Arc<FlowTable>,
    pub registry: Arc<TunnelRegistry>,
    pub rules: Arc<RulesHandle>,
    pub filter: Arc<IpFilter>,
    pub domain_ip: Arc<DomainIpTable>,
    pub geoip: Arc<GeoIpRules>,
    pub fakeip: Option<Arc<FakeIpPool>>,
    pub process: Arc<dyn ProcessIndex>,
    pub host_filter: Arc<dyn HostFilter>,
    pub tcp_ports: Arc<PortSet>,
    pub udp_ports: Arc<PortSet>,
    pub vpn_ips: Arc<VpnIpMap>,
    pub writer: TunWriterHandle,
    pub tun_ip: Ipv4Addr,
    pub dns_tunnel_ids: Vec<String>,
    pub self_pid: u32,
}

/// The central packet loop: one reader task, one reusable buffer, every
/// outcome local to the current packet.
pub struct Router {
    pub(crate) flows: Arc<FlowTable>,
    pub(crate) registry: Arc<TunnelRegistry>,
    pub(crate) rules: Arc<RulesHandle>,
    pub(crate) filter: Arc<IpFilter>,
    pub(crate) domain_ip: Arc<DomainIpTable>,
    pub(crate) geoip: Arc<GeoIpRules>,
    pub(crate) fakeip: Option<Arc<FakeIpPool>>,
    pub(crate) process: Arc<dyn ProcessIndex>,
    pub(crate) host_filter: Arc<dyn HostFilter>,
    tcp_ports: Arc<PortSet>,
    udp_ports: Arc<PortSet>,
    vpn_ips: Arc<VpnIpMap>,
    writer: TunWriterHandle,
    tun_ip: Ipv4Addr,
    dns_tunnel_ids: Vec<String>,
    pub(crate) self_pid: u32,
    slow_path: SlowPathTimer,
    malformed: AtomicU64,
}

impl Router {
    pub fn new(params: RouterParams) -> Self {
        Self {
            flows: params.flows,
            registry: params.registry,
            rules: params.rules,
            filter: params.filter,
            domain_ip: params.domain_ip,
            geoip: params.geoip,
            fakeip: params.fakeip,
            process: params.process,
            host_filter: params.host_filter,
            tcp_ports: params.tcp_ports,
            udp_ports: params.udp_ports,
            vpn_ips: params.vpn_ips,
            writer: params.writer,
            tun_ip: params.tun_ip,
            dns_tunnel_ids: params.dns_tunnel_ids,
            self_pid: params.self_pid,
            slow_path: SlowPathTimer::default(),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn slow_path(&self) -> &SlowPathTimer {
        &self.slow_path
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub async fn run(
        self: Arc<Self>,
        mut adapter: impl TunAdapter,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = adapter.read_packet(&mut buf) => {
                    let n = read?;
                    self.handle_outbound(&mut buf[..n]);
                }
            }
        }
    }

    pub fn handle_outbound(&self, pkt: &mut [u8]) {
        let Some(mut meta) = packet::parse(pkt) else {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match meta.proto {
            Proto::Tcp => self.handle_tcp(pkt, &mut meta),
            Proto::Udp => self.handle_udp(pkt, &mut meta),
            Proto::Icmp => self.handle_icmp(pkt, &mut meta),
        }
    }

    fn handle_tcp(&self, pkt: &mut [u8], meta: &mut PacketMeta) {
        let now = self.flows.clock().now();

        // Response from a hairpin proxy back to the client.
        if self.tcp_ports.contains(meta.src_port) {
            let key = NatKey::new(meta.dst, meta.dst_port);
            let Some(nat) = self.flows.tcp.get(&key) else {
                return;
            };
            if meta.tcp_flags & TCP_RST != 0 {
                self.flows.tcp.remove(&key);
            } else {
                nat.touch(now);
                if meta.tcp_flags & TCP_FIN != 0 {
                    nat.mark_fin(FIN_SERVER, now);
                }
            }
            packet::set_src_port(pkt, meta, nat.orig_dst_port);
            packet::swap_ips(pkt, meta);
            packet::set_src_ip(pkt, meta, nat.orig_dst);
            self.writer.send(pkt.to_vec());
            return;
        }

        if meta.tcp_flags & TCP_SYN != 0 && meta.tcp_flags & TCP_ACK == 0 {
            self.route_new_flow(pkt, meta, now);
            return;
        }

        // Established flow: the raw path wins over the hairpin path.
        let raw_key = self.raw_key_for(meta);
        if let Some(flow) = self.flows.raw.get(&raw_key) {
            if meta.tcp_flags & TCP_RST != 0 {
                self.flows.remove_raw(&raw_key);
            } else {
                flow.touch(now);
            }
            self.inject_raw(pkt, meta, &flow);
            return;
        }

        let key = NatKey::new(meta.dst, meta.src_port);
        if let Some(nat) = self.flows.tcp.get(&key) {
            if meta.tcp_flags & TCP_RST != 0 {
                self.flows.tcp.remove(&key);
            } else {
                nat.touch(now);
                if meta.tcp_flags & TCP_FIN != 0 {
                    nat.mark_fin(FIN_CLIENT, now);
                }
            }
            let proxy_port = nat.proxy_port;
            packet::swap_ips(pkt, meta);
            packet::set_dst_port(pkt, meta, proxy_port);
            self.writer.send(pkt.to_vec());
            return;
        }

        // Orphan mid-stream packet; treat it like a late SYN.
        self.route_new_flow(pkt, meta, now);
    }

    fn handle_udp(&self, pkt: &mut [u8], meta: &mut PacketMeta) {
        if meta.dst.is_multicast() || meta.dst == Ipv4Addr::BROADCAST {
            return;
        }
        let now = self.flows.clock().now();

        // Response from a UDP proxy or from the local resolver.
        if self.udp_ports.contains(meta.src_port)
            || (meta.src_port == 53 && meta.src == self.tun_ip)
        {
            let key = NatKey::new(meta.dst, meta.dst_port);
            let Some(nat) = self.flows.udp.get(&key) else {
                return;
            };
            nat.touch(now);
            packet::set_src_port(pkt, meta, nat.orig_dst_port);
            packet::swap_ips(pkt, meta);
            packet::set_src_ip(pkt, meta, nat.orig_dst);
            self.writer.send(pkt.to_vec());
            return;
        }

        let raw_key = self.raw_key_for(meta);
        if let Some(flow) = self.flows.raw.get(&raw_key) {
            flow.touch(now);
            self.inject_raw(pkt, meta, &flow);
            return;
        }

        let key = NatKey::new(meta.dst, meta.src_port);
        if let Some(nat) = self.flows.udp.get(&key) {
            nat.touch(now);
            let proxy_port = nat.proxy_port;
            packet::swap_ips(pkt, meta);
            packet::set_dst_port(pkt, meta, proxy_port);
            self.writer.send(pkt.to_vec());
            return;
        }

        if meta.dst_port == 53 {
            self.route_new_dns(pkt, meta, now);
            return;
        }
        self.route_new_flow(pkt, meta, now);
    }

    fn handle_icmp(&self, pkt: &mut [u8], meta: &mut PacketMeta) {
        let now = self.flows.clock().now();
        let raw_key = self.raw_key_for(meta);
        if let Some(flow) = self.flows.raw.get(&raw_key) {
            flow.touch(now);
            self.inject_raw(pkt, meta, &flow);
            return;
        }

        // No PID lookup for ICMP: domain table, then the DNS tunnel, then
        // any raw-capable tunnel; otherwise leave it alone.
        let entry = self
            .domain_ip
            .get(meta.dst)
            .filter(|e| e.action == splittun_domain::DomainAction::Route)
            .and_then(|e| self.registry.get(&e.tunnel_id))
            .filter(|e| e.is_up())
            .or_else(|| self.first_dns_tunnel())
            .or_else(|| self.registry.any_up_raw());
        let Some(entry) = entry else {
            return;
        };
        self.raw_route(pkt, meta, &entry, Priority::Normal, None, None, now);
    }

    /// Classify a fresh flow and dispatch it: raw inject for raw-capable
    /// tunnels, hairpin into the tunnel's proxy otherwise.
    fn route_new_flow(&self, pkt: &mut [u8], meta: &mut PacketMeta, now: u64) {
        let start = Instant::now();
        let decision = self.classify(meta);
        self.slow_path.observe(start.elapsed());

        let entry = match decision.verdict {
            FlowVerdict::Drop => return,
            FlowVerdict::Pass => self.registry.get(DIRECT_ID),
            FlowVerdict::Route => decision
                .tunnel_id
                .as_deref()
                .and_then(|id| self.registry.get(id)),
        };
        let Some(entry) = entry else {
            return;
        };

        if entry.provider.raw_forwarder().is_some() && entry.provider.adapter_ip().is_some() {
            self.raw_route(
                pkt,
                meta,
                &entry,
                decision.priority,
                decision.fake_dst,
                decision.resolved_dst,
                now,
            );
            return;
        }
        self.hairpin(pkt, meta, &entry, decision.failover, decision.resolved_dst, now);
    }

    /// DNS goes through the configured DNS tunnel for matched processes;
    /// everything else lands on the local resolver at TUN-IP:53.
    fn route_new_dns(&self, pkt: &mut [u8], meta: &mut PacketMeta, now: u64) {
        let start = Instant::now();
        let decision = self.classify(meta);
        self.slow_path.observe(start.elapsed());

        match decision.verdict {
            FlowVerdict::Drop => return,
            FlowVerdict::Route => {
                if let Some(entry) = self.first_dns_tunnel() {
                    if entry.provider.raw_forwarder().is_some()
                        && entry.provider.adapter_ip().is_some()
                    {
                        self.raw_route(
                            pkt,
                            meta,
                            &entry,
                            decision.priority,
                            decision.fake_dst,
                            decision.resolved_dst,
                            now,
                        );
                    } else {
                        self.hairpin(
                            pkt,
                            meta,
                            &entry,
                            decision.failover,
                            decision.resolved_dst,
                            now,
                        );
                    }
                    return;
                }
            }
            FlowVerdict::Pass => {}
        }

        // Hairpin into the local resolver: after the swap the packet is
        // addressed to TUN-IP:53 and the NAT entry reverses the reply.
        let key = NatKey::new(meta.dst, meta.src_port);
        self.flows.udp.insert(
            key,
            Arc::new(UdpNat::new(
                meta.dst,
                meta.dst_port,
                DIRECT_ID.to_string(),
                53,
                None,
                None,
                now,
            )),
        );
        packet::swap_ips(pkt, meta);
        self.writer.send(pkt.to_vec());
    }

    fn hairpin(
        &self,
        pkt: &mut [u8],
        meta: &mut PacketMeta,
        entry: &Arc<TunnelEntry>,
        failover: Option<splittun_flow::FailoverCtx>,
        resolved_dst: Option<Ipv4Addr>,
        now: u64,
    ) {
        let key = NatKey::new(meta.dst, meta.src_port);
        let proxy_port = match meta.proto {
            Proto::Tcp => {
                self.flows.tcp.insert(
                    key,
                    Arc::new(TcpNat::new(
                        meta.dst,
                        meta.dst_port,
                        entry.id.clone(),
                        entry.tcp_port,
                        failover,
                        resolved_dst,
                        now,
                    )),
                );
                entry.tcp_port
            }
            Proto::Udp => {
                self.flows.udp.insert(
                    key,
                    Arc::new(UdpNat::new(
                        meta.dst,
                        meta.dst_port,
                        entry.id.clone(),
                        entry.udp_port,
                        failover,
                        resolved_dst,
                        now,
                    )),
                );
                entry.udp_port
            }
            Proto::Icmp => return,
        };
        packet::swap_ips(pkt, meta);
        packet::set_dst_port(pkt, meta, proxy_port);
        self.writer.send(pkt.to_vec());
    }

    #[allow(clippy::too_many_arguments)]
    fn raw_route(
        &self,
        pkt: &mut [u8],
        meta: &mut PacketMeta,
        entry: &Arc<TunnelEntry>,
        priority: Priority,
        fake_dst: Option<Ipv4Addr>,
        resolved_dst: Option<Ipv4Addr>,
        now: u64,
    ) {
        let Some(vpn_ip) = entry.provider.adapter_ip() else {
            return;
        };
        if entry.provider.raw_forwarder().is_none() {
            return;
        }
        let real_dst = resolved_dst.unwrap_or(meta.dst);
        let key = RawKey::new(meta.proto, real_dst, meta.src_port);
        self.flows.raw.insert(
            key,
            Arc::new(RawFlow::new(
                entry.id.clone(),
                vpn_ip,
                priority,
                priority == Priority::Auto,
                fake_dst,
                resolved_dst,
                now,
            )),
        );
        if let (Some(pool), Some(fake)) = (&self.fakeip, fake_dst) {
            pool.inc_flows(fake);
        }
        if meta.dst != real_dst {
            packet::set_dst_ip(pkt, meta, real_dst);
        }
        packet::set_src_ip(pkt, meta, vpn_ip);
        if meta.tcp_flags & TCP_SYN != 0 {
            packet::clamp_mss(pkt, meta);
        }
        self.finish_inject(pkt, meta, priority, &entry.id);
    }

    fn inject_raw(&self, pkt: &mut [u8], meta: &mut PacketMeta, flow: &RawFlow) {
        if let Some(real) = flow.resolved_dst
            && meta.dst != real
        {
            packet::set_dst_ip(pkt, meta, real);
        }
        packet::set_src_ip(pkt, meta, flow.vpn_ip);
        self.finish_inject(pkt, meta, flow.priority, &flow.tunnel_id);
    }

    fn finish_inject(&self, pkt: &mut [u8], meta: &PacketMeta, priority: Priority, tunnel_id: &str) {
        let class = qos::egress_class(priority, meta);
        if let Some(tos) = qos::tos_for(meta, class) {
            packet::mark_dscp(pkt, tos);
        }
        let Some(entry) = self.registry.get(tunnel_id) else {
            return;
        };
        let Some(raw) = entry.provider.raw_forwarder() else {
            return;
        };
        if !raw.inject_with_priority(pkt, priority) {
            self.writer.drops().increment("raw inject dropped");
        }
    }

    fn first_dns_tunnel(&self) -> Option<Arc<TunnelEntry>> {
        self.dns_tunnel_ids
            .iter()
            .find_map(|id| self.registry.get(id).filter(|e| e.is_up()))
    }

    /// Raw flows are keyed by the real destination; synthetic addresses
    /// translate through the pool first.
    fn raw_key_for(&self, meta: &PacketMeta) -> RawKey {
        let mut dst = meta.dst;
        if let Some(pool) = &self.fakeip
            && pool.in_range(dst)
            && let Some(view) = pool.lookup(dst)
            && let Some(real) = view.real_ips.first()
        {
            dst = *real;
        }
        RawKey::new(meta.proto, dst, meta.src_port)
    }

    /// Inbound path for raw forwarders: consume only packets belonging to
    /// a known raw flow so the provider's own IP stack keeps serving the
    /// proxy dials.
    pub fn handle_inbound(&self, pkt: &mut [u8]) -> bool {
        let Some(mut meta) = packet::parse(pkt) else {
            return false;
        };
        if !self.vpn_ips.contains(meta.dst) {
            return false;
        }
        let port = match meta.proto {
            Proto::Icmp => meta.src_port,
            _ => meta.dst_port,
        };
        let key = RawKey::new(meta.proto, meta.src, port);
        let Some(flow) = self.flows.raw.get(&key) else {
            return false;
        };
        flow.touch(self.flows.clock().now());

        if meta.proto == Proto::Tcp
            && meta.tcp_flags & (TCP_SYN | TCP_ACK) == (TCP_SYN | TCP_ACK)
        {
            packet::clamp_mss(pkt, &meta);
        }
        // The client addressed the synthetic IP; replies must come from it.
        if let Some(fake) = flow.fake_dst {
            packet::set_src_ip(pkt, &mut meta, fake);
        }
        packet::set_dst_ip(pkt, &mut meta, self.tun_ip);
        self.writer.send(pkt.to_vec());
        true
    }

    pub fn inbound_handler(self: &Arc<Self>) -> InboundHandler {
        let router = Arc::clone(self);
        Arc::new(move |pkt: &mut [u8]| router.handle_inbound(pkt))
    }

    /// Register the raw-flow eviction hook that releases FakeIP pins.
    pub fn install_fakeip_hook(&self) {
        if let Some(pool) = &self.fakeip {
            let pool = Arc::clone(pool);
            self.flows.set_raw_evict_hook(Box::new(move |_, flow| {
                if let Some(fake) = flow.fake_dst {
                    pool.dec_flows(fake);
                }
            }));
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("tun_ip", &self.tun_ip)
            .field("self_pid", &self.self_pid)
            .finish_non_exhaustive()
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        debug!(
            malformed = self.malformed_count(),
            classify_avg_us = self.slow_path.average_micros(),
            "router stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use splittun_domain::{DomainIpTable, GeoIpRules};
    use splittun_net::CoarseClock;
    use splittun_net::checksum::checksum;
    use splittun_rules::{
        ExeInfo, Fallback, IpFilter, IpFilterParams, RuleSet, RulesHandle,
    };
    use splittun_tunnel::{
        DatagramConn, DialError, DirectProvider, EventBus, ProxyStream, RawForwarder,
        TunnelState,
    };
    use std::collections::HashMap;
    use std::net::SocketAddrV4;
    use tokio::sync::mpsc;

    const TUN_IP: Ipv4Addr = Ipv4Addr::new(10, 255, 0, 1);
    const VPN_IP: Ipv4Addr = Ipv4Addr::new(10, 6, 0, 2);
    const SELF_PID: u32 = 4242;

    struct MockProcess {
        ports: HashMap<u16, u32>,
        exes: HashMap<u32, ExeInfo>,
    }

    impl ProcessIndex for MockProcess {
        fn owner_pid(&self, _proto: Proto, src_port: u16) -> Option<u32> {
            self.ports.get(&src_port).copied()
        }
        fn exe_of(&self, pid: u32) -> Option<ExeInfo> {
            self.exes.get(&pid).cloned()
        }
    }

    struct RecordingFilter(Arc<Mutex<Vec<String>>>);

    impl HostFilter for RecordingFilter {
        fn ensure_blocked(&self, exe_path: &str) -> anyhow::Result<()> {
            self.0.lock().push(exe_path.to_string());
            Ok(())
        }
        fn add_bypass_prefixes(&self, _prefixes: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        fn permit_direct_ip(&self, _ip: Ipv4Addr) -> anyhow::Result<()> {
            Ok(())
        }
        fn remove_direct_ip(&self, _ip: Ipv4Addr) -> anyhow::Result<()> {
            Ok(())
        }
        fn block_dns_on_interface(&self, _interface: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn permit_dns_for_self(&self, _interface: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn block_all_ipv6(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn unblock_all_processes(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn teardown(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct RawTunnel {
        vpn_ip: Ipv4Addr,
        injected: Mutex<Vec<(Vec<u8>, Priority)>>,
    }

    #[async_trait]
    impl splittun_tunnel::TunnelProvider for RawTunnel {
        async fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        fn adapter_ip(&self) -> Option<Ipv4Addr> {
            Some(self.vpn_ip)
        }
        async fn dial_tcp(
            &self,
            _target: SocketAddrV4,
        ) -> Result<Box<dyn ProxyStream>, DialError> {
            Err(DialError::Other("raw only".to_string()))
        }
        async fn dial_udp(
            &self,
            _target: SocketAddrV4,
        ) -> Result<Box<dyn DatagramConn>, DialError> {
            Err(DialError::UdpNotSupported)
        }
        fn name(&self) -> &str {
            "raw"
        }
        fn protocol(&self) -> &str {
            "wg"
        }
        fn raw_forwarder(&self) -> Option<&dyn RawForwarder> {
            Some(self)
        }
    }

    impl RawForwarder for RawTunnel {
        fn inject(&self, pkt: &[u8]) -> bool {
            self.injected.lock().push((pkt.to_vec(), Priority::Normal));
            true
        }
        fn inject_with_priority(&self, pkt: &[u8], priority: Priority) -> bool {
            self.injected.lock().push((pkt.to_vec(), priority));
            true
        }
        fn set_inbound_handler(&self, _handler: InboundHandler) {}
    }

    struct CaptureSink(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl crate::writer::TunSink for CaptureSink {
        async fn write_packet(&mut self, pkt: &[u8]) -> std::io::Result<()> {
            let _ = self.0.send(pkt.to_vec());
            Ok(())
        }
    }

    struct Fix {
        router: Arc<Router>,
        written: mpsc::UnboundedReceiver<Vec<u8>>,
        raw: Arc<RawTunnel>,
        blocked: Arc<Mutex<Vec<String>>>,
        _cancel: CancellationToken,
    }

    fn fixture(rules: RuleSet) -> Fix {
        let clock = CoarseClock::new();
        clock.store(1_000);
        let flows = Arc::new(FlowTable::new(clock.clone()));
        let registry = Arc::new(TunnelRegistry::new(Arc::new(EventBus::new())));
        registry
            .register(TunnelEntry::new(
                "tun-a".to_string(),
                "tun-a".to_string(),
                "http".to_string(),
                34911,
                35001,
                Arc::new(DirectProvider::default()),
            ))
            .unwrap();
        registry.set_state("tun-a", TunnelState::Up, None);

        let raw = Arc::new(RawTunnel {
            vpn_ip: VPN_IP,
            injected: Mutex::new(Vec::new()),
        });
        registry
            .register(TunnelEntry::new(
                "tun-raw".to_string(),
                "tun-raw".to_string(),
                "wg".to_string(),
                0,
                0,
                Arc::clone(&raw) as Arc<dyn splittun_tunnel::TunnelProvider>,
            ))
            .unwrap();
        registry.set_state("tun-raw", TunnelState::Up, None);

        registry
            .register(TunnelEntry::new(
                DIRECT_ID.to_string(),
                DIRECT_ID.to_string(),
                "direct".to_string(),
                38001,
                38002,
                Arc::new(DirectProvider::default()),
            ))
            .unwrap();
        registry.set_state(DIRECT_ID, TunnelState::Up, None);

        let tcp_ports = Arc::new(PortSet::new());
        tcp_ports.add(34911);
        tcp_ports.add(38001);
        let udp_ports = Arc::new(PortSet::new());
        udp_ports.add(35001);
        udp_ports.add(38002);
        let vpn_ips = Arc::new(VpnIpMap::new());
        vpn_ips.set(VPN_IP, "tun-raw".to_string());

        let mut ports = HashMap::new();
        ports.insert(43211, 500);
        ports.insert(43299, SELF_PID);
        ports.insert(40000, 600);
        let mut exes = HashMap::new();
        exes.insert(500, ExeInfo::from_path("/usr/bin/video-app"));
        exes.insert(SELF_PID, ExeInfo::from_path("/usr/bin/splittun"));
        exes.insert(600, ExeInfo::from_path("/usr/bin/unmatched"));

        let blocked = Arc::new(Mutex::new(Vec::new()));
        let (written_tx, written) = mpsc::unbounded_channel();
        let drops = Arc::new(splittun_diag::DropCounter::default());
        let (handle, writer) = crate::writer::tun_writer(Box::new(CaptureSink(written_tx)), drops);
        let cancel = CancellationToken::new();
        tokio::spawn(writer.run(cancel.clone()));

        let router = Arc::new(Router::new(RouterParams {
            flows,
            registry,
            rules: Arc::new(RulesHandle::new(rules)),
            filter: Arc::new(IpFilter::build(IpFilterParams::default()).unwrap()),
            domain_ip: Arc::new(DomainIpTable::new(clock.clone())),
            geoip: Arc::new(GeoIpRules::default()),
            fakeip: None,
            process: Arc::new(MockProcess { ports, exes }),
            host_filter: Arc::new(RecordingFilter(Arc::clone(&blocked))),
            tcp_ports,
            udp_ports,
            vpn_ips,
            writer: handle,
            tun_ip: TUN_IP,
            dns_tunnel_ids: Vec::new(),
            self_pid: SELF_PID,
        }));
        Fix {
            router,
            written,
            raw,
            blocked,
            _cancel: cancel,
        }
    }

    fn video_rule(tunnel: &str) -> RuleSet {
        RuleSet::build([(
            "video-app".to_string(),
            tunnel.to_string(),
            Fallback::AllowDirect,
            splittun_rules::Priority::Normal,
        )])
        .unwrap()
    }

    fn finish_ip(buf: &mut [u8]) {
        buf[10] = 0;
        buf[11] = 0;
        let sum = checksum(&buf[..20]);
        buf[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    fn transport_sum(buf: &[u8], proto: u8) -> u16 {
        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&buf[12..20]);
        pseudo.push(0);
        pseudo.push(proto);
        pseudo.extend_from_slice(&((buf.len() - 20) as u16).to_be_bytes());
        pseudo.extend_from_slice(&buf[20..]);
        checksum(&pseudo)
    }

    fn build_tcp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, flags: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 40];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&40u16.to_be_bytes());
        buf[8] = 64;
        buf[9] = 6;
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());
        finish_ip(&mut buf);
        buf[20..22].copy_from_slice(&sport.to_be_bytes());
        buf[22..24].copy_from_slice(&dport.to_be_bytes());
        buf[32] = 0x50;
        buf[33] = flags;
        let sum = transport_sum(&buf, 6);
        buf[36..38].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    fn build_udp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let total = 28 + payload.len();
        let mut buf = vec![0u8; total];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        buf[8] = 64;
        buf[9] = 17;
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());
        finish_ip(&mut buf);
        buf[20..22].copy_from_slice(&sport.to_be_bytes());
        buf[22..24].copy_from_slice(&dport.to_be_bytes());
        buf[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        buf[28..].copy_from_slice(payload);
        let sum = transport_sum(&buf, 17);
        buf[26..28].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    fn build_icmp_echo(src: Ipv4Addr, dst: Ipv4Addr, ident: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 28];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&28u16.to_be_bytes());
        buf[8] = 64;
        buf[9] = 1;
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());
        finish_ip(&mut buf);
        buf[20] = 8; // echo request
        buf[24..26].copy_from_slice(&ident.to_be_bytes());
        let sum = checksum(&buf[20..]);
        buf[22..24].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    fn assert_valid(buf: &[u8]) {
        let mut copy = buf.to_vec();
        let stored = u16::from_be_bytes([copy[10], copy[11]]);
        copy[10] = 0;
        copy[11] = 0;
        assert_eq!(stored, checksum(&copy[..20]), "ip checksum");
        let proto = copy[9];
        if proto == 6 || proto == 17 {
            let off = if proto == 6 { 36 } else { 26 };
            let stored = u16::from_be_bytes([copy[off], copy[off + 1]]);
            if proto == 17 && stored == 0 {
                return;
            }
            copy[off] = 0;
            copy[off + 1] = 0;
            assert_eq!(stored, transport_sum(&copy, proto), "transport checksum");
        }
    }

    #[tokio::test]
    async fn syn_hairpins_and_response_reverses() {
        let mut fix = fixture(video_rule("tun-a"));
        let dst = Ipv4Addr::new(93, 184, 216, 34);

        let mut syn = build_tcp(TUN_IP, dst, 43211, 443, TCP_SYN);
        fix.router.handle_outbound(&mut syn);
        let out = fix.written.recv().await.unwrap();
        assert_valid(&out);
        let meta = packet::parse(&out).unwrap();
        assert_eq!(meta.src, dst);
        assert_eq!(meta.src_port, 43211);
        assert_eq!(meta.dst, TUN_IP);
        assert_eq!(meta.dst_port, 34911);

        let nat = fix
            .router
            .flows
            .tcp
            .get(&NatKey::new(dst, 43211))
            .unwrap();
        assert_eq!(nat.orig_dst, dst);
        assert_eq!(nat.orig_dst_port, 443);
        assert_eq!(nat.tunnel_id, "tun-a");
        assert_eq!(fix.blocked.lock().as_slice(), ["/usr/bin/video-app"]);

        // Proxy response flows back with the original source restored.
        let mut resp = build_tcp(TUN_IP, dst, 34911, 43211, TCP_ACK);
        fix.router.handle_outbound(&mut resp);
        let out = fix.written.recv().await.unwrap();
        assert_valid(&out);
        let meta = packet::parse(&out).unwrap();
        assert_eq!(meta.src, dst);
        assert_eq!(meta.src_port, 443);
        assert_eq!(meta.dst, TUN_IP);
        assert_eq!(meta.dst_port, 43211);
    }

    #[tokio::test]
    async fn established_packets_follow_the_nat_entry() {
        let mut fix = fixture(video_rule("tun-a"));
        let dst = Ipv4Addr::new(93, 184, 216, 34);

        let mut syn = build_tcp(TUN_IP, dst, 43211, 443, TCP_SYN);
        fix.router.handle_outbound(&mut syn);
        let _ = fix.written.recv().await.unwrap();

        let mut data = build_tcp(TUN_IP, dst, 43211, 443, TCP_ACK);
        fix.router.handle_outbound(&mut data);
        let out = fix.written.recv().await.unwrap();
        let meta = packet::parse(&out).unwrap();
        assert_eq!(meta.dst_port, 34911);

        // RST tears the entry down.
        let mut rst = build_tcp(TUN_IP, dst, 43211, 443, TCP_RST);
        fix.router.handle_outbound(&mut rst);
        let _ = fix.written.recv().await.unwrap();
        assert!(fix.router.flows.tcp.get(&NatKey::new(dst, 43211)).is_none());
    }

    #[tokio::test]
    async fn local_destinations_are_dropped() {
        let mut fix = fixture(video_rule("tun-a"));
        let mut syn = build_tcp(TUN_IP, Ipv4Addr::new(192, 168, 1, 1), 43211, 443, TCP_SYN);
        fix.router.handle_outbound(&mut syn);
        assert!(fix.written.try_recv().is_err());
        assert!(fix.router.flows.tcp.is_empty());
    }

    #[tokio::test]
    async fn own_sockets_never_loop() {
        let mut fix = fixture(video_rule("tun-a"));
        let mut syn = build_tcp(
            TUN_IP,
            Ipv4Addr::new(93, 184, 216, 34),
            43299,
            443,
            TCP_SYN,
        );
        fix.router.handle_outbound(&mut syn);
        assert!(fix.written.try_recv().is_err());
    }

    #[tokio::test]
    async fn unmatched_process_goes_direct() {
        let mut fix = fixture(video_rule("tun-a"));
        let mut syn = build_tcp(
            TUN_IP,
            Ipv4Addr::new(93, 184, 216, 34),
            40000,
            443,
            TCP_SYN,
        );
        fix.router.handle_outbound(&mut syn);
        let out = fix.written.recv().await.unwrap();
        let meta = packet::parse(&out).unwrap();
        assert_eq!(meta.dst_port, 38001);
    }

    #[tokio::test]
    async fn raw_tunnel_flow_injects_and_consumes_inbound() {
        let mut fix = fixture(video_rule("tun-raw"));
        let dst = Ipv4Addr::new(93, 184, 216, 34);

        let mut syn = build_tcp(TUN_IP, dst, 43211, 443, TCP_SYN);
        fix.router.handle_outbound(&mut syn);
        assert!(fix.written.try_recv().is_err());
        let injected = fix.raw.injected.lock().clone();
        assert_eq!(injected.len(), 1);
        let meta = packet::parse(&injected[0].0).unwrap();
        assert_eq!(meta.src, VPN_IP);
        assert_eq!(meta.dst, dst);
        assert!(
            fix.router
                .flows
                .raw
                .get(&RawKey::new(Proto::Tcp, dst, 43211))
                .is_some()
        );

        // Inbound reply keyed by an existing raw flow is consumed.
        let mut reply = build_tcp(dst, VPN_IP, 443, 43211, TCP_SYN | TCP_ACK);
        assert!(fix.router.handle_inbound(&mut reply));
        let out = fix.written.recv().await.unwrap();
        assert_valid(&out);
        let meta = packet::parse(&out).unwrap();
        assert_eq!(meta.dst, TUN_IP);
        assert_eq!(meta.src, dst);

        // Unknown inbound is left to the provider's own stack.
        let mut stray = build_tcp(dst, VPN_IP, 443, 9999, TCP_ACK);
        assert!(!fix.router.handle_inbound(&mut stray));
        let mut wrong_dst = build_tcp(dst, Ipv4Addr::new(10, 9, 9, 9), 443, 43211, TCP_ACK);
        assert!(!fix.router.handle_inbound(&mut wrong_dst));
    }

    #[tokio::test]
    async fn dns_from_unmatched_process_hairpins_to_resolver() {
        let mut fix = fixture(video_rule("tun-a"));
        let dns_server = Ipv4Addr::new(8, 8, 8, 8);

        let mut query = build_udp(TUN_IP, dns_server, 40000, 53, b"\x12\x34query");
        fix.router.handle_outbound(&mut query);
        let out = fix.written.recv().await.unwrap();
        assert_valid(&out);
        let meta = packet::parse(&out).unwrap();
        assert_eq!(meta.src, dns_server);
        assert_eq!(meta.dst, TUN_IP);
        assert_eq!(meta.dst_port, 53);

        // Resolver reply reverses through the same entry.
        let mut reply = build_udp(TUN_IP, dns_server, 53, 40000, b"\x12\x34answer");
        fix.router.handle_outbound(&mut reply);
        let out = fix.written.recv().await.unwrap();
        assert_valid(&out);
        let meta = packet::parse(&out).unwrap();
        assert_eq!(meta.src, dns_server);
        assert_eq!(meta.src_port, 53);
        assert_eq!(meta.dst, TUN_IP);
        assert_eq!(meta.dst_port, 40000);
    }

    #[tokio::test]
    async fn multicast_and_broadcast_are_silently_dropped() {
        let mut fix = fixture(video_rule("tun-a"));
        let mut mdns = build_udp(TUN_IP, Ipv4Addr::new(224, 0, 0, 251), 5353, 5353, b"q");
        fix.router.handle_outbound(&mut mdns);
        let mut bcast = build_udp(TUN_IP, Ipv4Addr::BROADCAST, 68, 67, b"dhcp");
        fix.router.handle_outbound(&mut bcast);
        assert!(fix.written.try_recv().is_err());
    }

    #[tokio::test]
    async fn icmp_echo_rides_any_raw_tunnel() {
        let fix = fixture(RuleSet::default());
        let dst = Ipv4Addr::new(1, 2, 3, 4);
        let mut echo = build_icmp_echo(TUN_IP, dst, 0x77);
        fix.router.handle_outbound(&mut echo);
        let injected = fix.raw.injected.lock().clone();
        assert_eq!(injected.len(), 1);
        let meta = packet::parse(&injected[0].0).unwrap();
        assert_eq!(meta.src, VPN_IP);
        assert_eq!(meta.proto, Proto::Icmp);
        assert!(
            fix.router
                .flows
                .raw
                .get(&RawKey::new(Proto::Icmp, dst, 0x77))
                .is_some()
        );
    }

    #[tokio::test]
    async fn malformed_packets_only_bump_the_counter() {
        let fix = fixture(RuleSet::default());
        let mut junk = vec![0u8; 10];
        fix.router.handle_outbound(&mut junk);
        let mut v6 = vec![0x60u8; 40];
        fix.router.handle_outbound(&mut v6);
        assert_eq!(fix.router.malformed_count(), 2);
    }
}
