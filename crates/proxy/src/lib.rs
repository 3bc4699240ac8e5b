mod fallback;
mod sni;
mod tcp;
mod udp;

pub use fallback::{DialOutcome, dial_tcp_chain, dial_tcp_fallback, should_fallback};
pub use sni::extract_sni;
pub use tcp::TcpProxy;
pub use udp::UdpProxy;

use std::sync::Arc;

use splittun_diag::StatsRegistry;
use splittun_domain::{FakeIpPool, MatcherHandle};
use splittun_flow::FlowTable;
use splittun_rules::RulesHandle;
use splittun_tunnel::TunnelRegistry;
use splittun_util::BufPool;

pub const RELAY_BUF_SIZE: usize = 1024 * 1024;
const RELAY_POOL_FREE: usize = 32;

/// State shared by every per-tunnel proxy instance.
pub struct ProxyShared {
    pub flows: Arc<FlowTable>,
    pub registry: Arc<TunnelRegistry>,
    pub rules: Arc<RulesHandle>,
    pub matcher: Arc<MatcherHandle>,
    pub fakeip: Option<Arc<FakeIpPool>>,
    pub stats: Arc<StatsRegistry>,
    pub pool: Arc<BufPool>,
    /// Peek ClientHello bytes for domain-action overrides.
    pub sni_enabled: bool,
}

impl ProxyShared {
    pub fn new(
        flows: Arc<FlowTable>,
        registry: Arc<TunnelRegistry>,
        rules: Arc<RulesHandle>,
        matcher: Arc<MatcherHandle>,
        fakeip: Option<Arc<FakeIpPool>>,
        stats: Arc<StatsRegistry>,
        sni_enabled: bool,
    ) -> Self {
        Self {
            flows,
            registry,
            rules,
            matcher,
            fakeip,
            stats,
            pool: Arc::new(BufPool::new(RELAY_BUF_SIZE, RELAY_POOL_FREE)),
            sni_enabled,
        }
    }
}
