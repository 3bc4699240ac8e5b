use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::unistd::Uid;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use splittun_cli::parse_cli;
use splittun_config::{Config, TunnelConfig};
use splittun_diag::{DropCounter, JitterProbe, StatsRegistry};
use splittun_dns::{CacheConfig, DnsCache, DnsService, ResolverConfig};
use splittun_domain::{
    DomainIpTable, DomainMatcher, DomainRuleSpec, DomainTarget, FakeIpPool, GeoDataDir,
    GeoIpRules, MatcherHandle,
};
use splittun_flow::{FlowTable, PortSet, VpnIpMap};
use splittun_hostfilter::{HostFilter, NftFilter, NoopFilter};
use splittun_net::{CoarseClock, parse_cidr};
use splittun_netlink::Netlink;
use splittun_proxy::{ProxyShared, TcpProxy, UdpProxy};
use splittun_router::{Router, RouterParams, tun_writer};
use splittun_rules::{
    IpFilter, IpFilterParams, LOCAL_BYPASS_CIDRS, ProcfsIndex, RuleSet, RulesHandle,
    TunnelFilterParams,
};
use splittun_tunnel::{
    DIRECT_ID, DirectProvider, Event, EventBus, HttpConnectProvider, HttpConnectSettings,
    TunnelEntry, TunnelProvider, TunnelRegistry, TunnelState,
};
use splittun_util::{CommandRunner, has_cap_net_admin};

use super::teardown::teardown;
use super::tun::{create_tun_device, ensure_tun_cidr_free};

const TUN_ROUTE_METRIC: u32 = 1;
const PROXY_BYPASS_MARK: u32 = 0x2;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub async fn run() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.verbose);
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    run_with_config(config, cli.verbose).await
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_with_config(config: Config, verbose: bool) -> Result<()> {
    ensure_linux()?;
    ensure_net_admin()?;

    let cancel = CancellationToken::new();
    let clock = CoarseClock::new();
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(TunnelRegistry::new(Arc::clone(&bus)));
    let stats = Arc::new(StatsRegistry::new());
    let flows = Arc::new(FlowTable::new(clock.clone()));
    let domain_ip = Arc::new(DomainIpTable::new(clock.clone()));

    // The physical default interface must be discovered before the TUN
    // route displaces it.
    let netlink = Netlink::new()?;
    let (phys_if, phys_ip) = netlink
        .default_interface()
        .await
        .context("no physical default route; is the network up?")?;
    info!(interface = %phys_if, ip = %phys_ip, "physical interface");

    let (tun_ip, tun_prefix) = config.tun_addr();
    ensure_tun_cidr_free(&netlink, tun_ip, tun_prefix).await?;
    let (tun_reader, tun_sink) = create_tun_device(&config.tun.name, tun_ip, tun_prefix)
        .context("failed to create TUN device")?;
    netlink
        .add_default_route(&config.tun.name, tun_ip, TUN_ROUTE_METRIC)
        .await?;

    let host_filter = build_host_filter(&config.tun.name, verbose)?;
    host_filter.block_all_ipv6()?;
    host_filter.add_bypass_prefixes(
        &LOCAL_BYPASS_CIDRS
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
    )?;
    host_filter.block_dns_on_interface(&phys_if)?;
    host_filter.permit_dns_for_self(&phys_if)?;

    // Routing tables built from config.
    let rules = Arc::new(RulesHandle::new(build_rules(&config)?));
    let filter = Arc::new(IpFilter::build(filter_params(&config))?);
    let matcher = Arc::new(MatcherHandle::new(build_matcher(&config)?));
    let geoip = Arc::new(build_geoip(&config)?);
    let fakeip = build_fakeip(&config)?;
    let sni_enabled = !config.domain_rules.is_empty() || !config.geosite_rules.is_empty();

    // Tunnel registration: proxy ports are bound first so they stay
    // immutable for the tunnel's lifetime.
    let mut proxy_listeners = Vec::new();
    for tunnel_cfg in &config.tunnels {
        let provider = build_provider(tunnel_cfg)?;
        let (tcp_listener, udp_socket) = bind_proxy_ports().await?;
        let entry = TunnelEntry::new(
            tunnel_cfg.id.clone(),
            if tunnel_cfg.name.is_empty() {
                tunnel_cfg.id.clone()
            } else {
                tunnel_cfg.name.clone()
            },
            tunnel_cfg.protocol.clone(),
            tcp_listener.local_addr()?.port(),
            udp_socket.local_addr()?.port(),
            provider,
        );
        registry.register(entry)?;
        proxy_listeners.push((tunnel_cfg.id.clone(), tcp_listener, udp_socket));
    }
    let direct = Arc::new(DirectProvider::new(
        Some(phys_if.clone()),
        Some(phys_ip),
        Some(PROXY_BYPASS_MARK),
    ));
    let (direct_tcp, direct_udp) = bind_proxy_ports().await?;
    registry.register(TunnelEntry::new(
        DIRECT_ID.to_string(),
        DIRECT_ID.to_string(),
        "direct".to_string(),
        direct_tcp.local_addr()?.port(),
        direct_udp.local_addr()?.port(),
        direct,
    ))?;
    registry.set_state(DIRECT_ID, TunnelState::Up, None);
    proxy_listeners.push((DIRECT_ID.to_string(), direct_tcp, direct_udp));

    let tcp_ports = Arc::new(PortSet::new());
    let udp_ports = Arc::new(PortSet::new());
    for (_, tcp, udp) in &proxy_listeners {
        tcp_ports.add(tcp.local_addr()?.port());
        udp_ports.add(udp.local_addr()?.port());
    }
    let vpn_ips = Arc::new(VpnIpMap::new());

    // State transitions keep the inbound VPN-IP map honest: a tunnel that
    // leaves Up stops matching inbound raw packets immediately.
    {
        let vpn_ips = Arc::clone(&vpn_ips);
        let registry = Arc::clone(&registry);
        bus.subscribe(Arc::new(move |event| {
            let Event::TunnelStateChanged { id, state, error } = event;
            let adapter_ip = registry.get(id).and_then(|entry| {
                entry
                    .provider
                    .raw_forwarder()
                    .is_some()
                    .then(|| entry.provider.adapter_ip())
                    .flatten()
            });
            match state {
                TunnelState::Up => {
                    if let Some(ip) = adapter_ip {
                        vpn_ips.set(ip, id.clone());
                    }
                    info!(tunnel = %id, "tunnel up");
                }
                TunnelState::Connecting => {}
                TunnelState::Down | TunnelState::Error => {
                    if let Some(ip) = adapter_ip {
                        vpn_ips.remove(ip);
                    }
                    match error {
                        Some(err) => warn!(tunnel = %id, %err, state = ?state, "tunnel state changed"),
                        None => info!(tunnel = %id, state = ?state, "tunnel state changed"),
                    }
                }
            }
        }));
    }

    // Router and the TUN writer.
    let drops = Arc::new(DropCounter::default());
    let (writer_handle, writer) = tun_writer(Box::new(tun_sink), Arc::clone(&drops));
    let router = Arc::new(Router::new(RouterParams {
        flows: Arc::clone(&flows),
        registry: Arc::clone(&registry),
        rules: Arc::clone(&rules),
        filter: Arc::clone(&filter),
        domain_ip: Arc::clone(&domain_ip),
        geoip: Arc::clone(&geoip),
        fakeip: fakeip.clone(),
        process: Arc::new(ProcfsIndex::new()),
        host_filter: Arc::clone(&host_filter),
        tcp_ports: Arc::clone(&tcp_ports),
        udp_ports: Arc::clone(&udp_ports),
        vpn_ips: Arc::clone(&vpn_ips),
        writer: writer_handle,
        tun_ip,
        dns_tunnel_ids: config.dns.tunnel_ids.clone(),
        self_pid: std::process::id(),
    }));
    router.install_fakeip_hook();

    // Connect tunnels concurrently; a failure leaves that tunnel in Error
    // and the rest keep going.
    let mut connects = JoinSet::new();
    for entry in registry.entries() {
        if entry.id == DIRECT_ID {
            continue;
        }
        let registry = Arc::clone(&registry);
        connects.spawn(async move {
            registry.set_state(&entry.id, TunnelState::Connecting, None);
            match entry.provider.connect().await {
                Ok(()) => registry.set_state(&entry.id, TunnelState::Up, None),
                Err(err) => {
                    error!(tunnel = %entry.id, %err, "tunnel connect failed");
                    registry.set_state(&entry.id, TunnelState::Error, Some(err.to_string()));
                }
            }
        });
    }
    while connects.join_next().await.is_some() {}

    // Wire raw forwarders and endpoint permits for tunnels that came up.
    // The VPN-IP map itself follows state transitions via the bus.
    for entry in registry.entries() {
        if let Some(raw) = entry.provider.raw_forwarder() {
            raw.set_inbound_handler(router.inbound_handler());
        }
        if let Some(endpoints) = entry.provider.endpoints() {
            let prefixes: Vec<String> =
                endpoints.iter().map(|e| format!("{}/32", e.ip())).collect();
            host_filter.add_bypass_prefixes(&prefixes)?;
        }
    }

    // DNS resolver on the TUN address.
    let dns_listen = match &config.dns.listen {
        Some(listen) => listen
            .parse::<SocketAddrV4>()
            .with_context(|| format!("invalid dns.listen: {listen}"))?,
        None => SocketAddrV4::new(tun_ip, 53),
    };
    let dns_service = Arc::new(DnsService::new(
        ResolverConfig {
            listen: dns_listen,
            servers: config.dns.servers.clone(),
            tunnel_ids: config.dns.tunnel_ids.clone(),
            timeout: Duration::from_secs(config.dns.timeout),
            fallback_direct: config.dns.fallback_direct,
            upstream_port: 53,
        },
        DnsCache::new(
            CacheConfig {
                max_size: config.dns.cache.max_size,
                min_ttl: config.dns.cache.min_ttl,
                max_ttl: config.dns.cache.max_ttl,
                neg_ttl: config.dns.cache.neg_ttl,
            },
            clock.clone(),
        ),
        Arc::clone(&matcher),
        Arc::clone(&domain_ip),
        fakeip.clone(),
        Arc::clone(&registry),
    ));

    // Direct-domain answers get a temporary host-filter permit for the
    // resolved IP; expiry takes it back.
    {
        let permit = Arc::clone(&host_filter);
        let remove = Arc::clone(&host_filter);
        domain_ip.set_direct_hooks(
            Box::new(move |ip| {
                if let Err(err) = permit.permit_direct_ip(ip) {
                    warn!(%ip, %err, "failed to permit direct ip");
                }
            }),
            Box::new(move |ip| {
                if let Err(err) = remove.remove_direct_ip(ip) {
                    warn!(%ip, %err, "failed to remove direct ip permit");
                }
            }),
        );
    }

    // Task set: router, writer, proxies, DNS, clock, cleaners, probes,
    // reporter.
    let mut tasks = JoinSet::new();
    tasks.spawn(clock.clone().run(cancel.clone()));
    tasks.spawn(writer.run(cancel.clone()));
    {
        let router = Arc::clone(&router);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(err) = router.run(tun_reader, cancel).await {
                error!(%err, "tun router stopped");
            }
        });
    }

    let proxy_shared = Arc::new(ProxyShared::new(
        Arc::clone(&flows),
        Arc::clone(&registry),
        Arc::clone(&rules),
        Arc::clone(&matcher),
        fakeip.clone(),
        Arc::clone(&stats),
        sni_enabled,
    ));
    for (id, tcp_listener, udp_socket) in proxy_listeners {
        info!(
            tunnel = %id,
            tcp = tcp_listener.local_addr()?.port(),
            udp = udp_socket.local_addr()?.port(),
            "proxy listeners up"
        );
        tasks.spawn(TcpProxy::new(tcp_listener, Arc::clone(&proxy_shared)).run(cancel.clone()));
        tasks.spawn(UdpProxy::new(udp_socket, Arc::clone(&proxy_shared)).run(cancel.clone()));
    }

    {
        let service = Arc::clone(&dns_service);
        let cancel_udp = cancel.clone();
        tasks.spawn(async move {
            if let Err(err) = service.run_udp(cancel_udp).await {
                error!(%err, "dns udp listener stopped");
            }
        });
        let service = Arc::clone(&dns_service);
        let cancel_tcp = cancel.clone();
        tasks.spawn(async move {
            if let Err(err) = service.run_tcp(cancel_tcp).await {
                error!(%err, "dns tcp listener stopped");
            }
        });
    }

    tasks.spawn(Arc::clone(&flows).run_tcp_cleanup(cancel.clone()));
    tasks.spawn(Arc::clone(&flows).run_udp_cleanup(cancel.clone()));
    tasks.spawn(Arc::clone(&flows).run_raw_cleanup(cancel.clone()));
    tasks.spawn(Arc::clone(&domain_ip).run_cleanup(cancel.clone()));
    tasks.spawn(Arc::clone(&stats).run_reporter(cancel.clone()));
    for entry in registry.entries() {
        if entry.id != DIRECT_ID {
            tasks.spawn(JitterProbe::new(entry).run(cancel.clone()));
        }
    }

    info!(tun = %config.tun.name, %tun_ip, "splittun up");
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    cancel.cancel();

    // 10 s watchdog: a wedged task must not hold the shutdown hostage.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        error!("shutdown watchdog expired, forcing exit");
        tasks.abort_all();
    }

    teardown(&registry, host_filter.as_ref()).await;
    Ok(())
}

fn ensure_linux() -> Result<()> {
    if std::env::consts::OS != "linux" {
        return Err(anyhow!("this tool only supports Linux"));
    }
    Ok(())
}

fn ensure_net_admin() -> Result<()> {
    if Uid::effective().is_root() || has_cap_net_admin() {
        return Ok(());
    }
    Err(anyhow!("must be run as root or have CAP_NET_ADMIN"))
}

fn build_host_filter(tun_name: &str, verbose: bool) -> Result<Arc<dyn HostFilter>> {
    let runner = CommandRunner::new(verbose, false);
    match NftFilter::new(
        "splittun".to_string(),
        tun_name.to_string(),
        PROXY_BYPASS_MARK,
        runner,
    ) {
        Ok(filter) => Ok(Arc::new(filter)),
        Err(err) => {
            warn!(%err, "nftables unavailable; per-process blocking disabled");
            Ok(Arc::new(NoopFilter))
        }
    }
}

async fn bind_proxy_ports() -> Result<(TcpListener, UdpSocket)> {
    let tcp = TcpListener::bind("0.0.0.0:0")
        .await
        .context("failed to bind proxy tcp listener")?;
    let udp = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind proxy udp socket")?;
    Ok((tcp, udp))
}

fn build_provider(cfg: &TunnelConfig) -> Result<Arc<dyn TunnelProvider>> {
    match cfg.protocol.as_str() {
        "http" => {
            let server = cfg
                .settings
                .server
                .clone()
                .ok_or_else(|| anyhow!("tunnel {}: settings.server is required", cfg.id))?;
            let port = cfg
                .settings
                .port
                .ok_or_else(|| anyhow!("tunnel {}: settings.port is required", cfg.id))?;
            Ok(Arc::new(HttpConnectProvider::new(
                cfg.id.clone(),
                HttpConnectSettings {
                    host: server,
                    port,
                    username: cfg.settings.username.clone(),
                    password: cfg.settings.password.clone(),
                },
            )))
        }
        other => Err(anyhow!("tunnel {}: unsupported protocol {other}", cfg.id)),
    }
}

fn build_rules(config: &Config) -> Result<RuleSet> {
    RuleSet::build(config.rules.iter().map(|r| {
        (
            r.pattern.clone(),
            r.tunnel_id.clone(),
            r.fallback.into(),
            r.priority.into(),
        )
    }))
}

fn filter_params(config: &Config) -> IpFilterParams {
    IpFilterParams {
        disallowed_ips: config.global_filter.disallowed_ips.clone(),
        allowed_ips: config.global_filter.allowed_ips.clone(),
        disallowed_apps: config.global_filter.disallowed_apps.clone(),
        disable_local: config.global_filter.disable_local,
        tunnels: config
            .tunnels
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    TunnelFilterParams {
                        allowed_ips: t.allowed_ips.clone(),
                        disallowed_ips: t.disallowed_ips.clone(),
                        disallowed_apps: t.disallowed_apps.clone(),
                    },
                )
            })
            .collect(),
    }
}

fn build_matcher(config: &Config) -> Result<DomainMatcher> {
    let mut specs: Vec<DomainRuleSpec> = config
        .domain_rules
        .iter()
        .map(|r| DomainRuleSpec {
            pattern: r.pattern.clone(),
            target: DomainTarget {
                action: r.action.into(),
                tunnel_id: r.tunnel_id.clone(),
            },
        })
        .collect();
    if !config.geosite_rules.is_empty() {
        let geodata = GeoDataDir::new(&config.geodata_dir);
        for rule in &config.geosite_rules {
            specs.extend(geodata.geosite_rules(
                &rule.category,
                DomainTarget {
                    action: rule.action.into(),
                    tunnel_id: rule.tunnel_id.clone(),
                },
            )?);
        }
    }
    DomainMatcher::build(specs)
}

fn build_geoip(config: &Config) -> Result<GeoIpRules> {
    let mut rules = GeoIpRules::default();
    if config.geoip_rules.is_empty() {
        return Ok(rules);
    }
    let geodata = GeoDataDir::new(&config.geodata_dir);
    for rule in &config.geoip_rules {
        let cidrs = geodata.geoip_cidrs(&rule.country)?;
        rules.add(
            &rule.country,
            &cidrs,
            DomainTarget {
                action: rule.action.into(),
                tunnel_id: rule.tunnel_id.clone(),
            },
        );
    }
    Ok(rules)
}

fn build_fakeip(config: &Config) -> Result<Option<Arc<FakeIpPool>>> {
    if !config.fakeip.enabled {
        return Ok(None);
    }
    let (addr, prefix) = parse_cidr(&config.fakeip.cidr)?;
    Ok(Some(Arc::new(FakeIpPool::new(addr, prefix)?)))
}
