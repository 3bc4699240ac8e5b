use std::collections::HashMap;
use std::net::Ipv4Addr;

use anyhow::Result;

use splittun_net::{PrefixTrie, parse_cidr};

use crate::pattern::Pattern;

/// CIDRs with no route via the physical NIC: RFC 1918, link-local,
/// multicast, loopback and the all-ones broadcast.
pub const LOCAL_BYPASS_CIDRS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "224.0.0.0/4",
    "127.0.0.0/8",
    "255.255.255.255/32",
];

#[derive(Debug, Clone, Default)]
pub struct TunnelFilterParams {
    pub allowed_ips: Vec<String>,
    pub disallowed_ips: Vec<String>,
    pub disallowed_apps: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IpFilterParams {
    pub disallowed_ips: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub disallowed_apps: Vec<String>,
    pub disable_local: bool,
    pub tunnels: Vec<(String, TunnelFilterParams)>,
}

struct TunnelFilter {
    disallowed: PrefixTrie,
    allowed: PrefixTrie,
    allowed_set: bool,
    disallowed_apps: Vec<Pattern>,
}

/// Composite destination/application filter evaluated per flow.
pub struct IpFilter {
    global_disallowed: PrefixTrie,
    global_allowed: PrefixTrie,
    global_allowed_set: bool,
    global_disallowed_apps: Vec<Pattern>,
    tunnels: HashMap<String, TunnelFilter>,
    local_bypass: PrefixTrie,
}

impl IpFilter {
    pub fn build(params: IpFilterParams) -> Result<Self> {
        let mut global_disallowed = PrefixTrie::new();
        let mut local_bypass = PrefixTrie::new();
        if !params.disable_local {
            for cidr in LOCAL_BYPASS_CIDRS {
                let (addr, len) = parse_cidr(cidr)?;
                global_disallowed.insert(addr, len);
                local_bypass.insert(addr, len);
            }
        }
        for cidr in &params.disallowed_ips {
            let (addr, len) = parse_cidr(cidr)?;
            global_disallowed.insert(addr, len);
        }

        let mut global_allowed = PrefixTrie::new();
        for cidr in &params.allowed_ips {
            let (addr, len) = parse_cidr(cidr)?;
            global_allowed.insert(addr, len);
        }

        let mut global_disallowed_apps = Vec::new();
        for app in &params.disallowed_apps {
            global_disallowed_apps.push(Pattern::parse(app)?);
        }

        let mut tunnels = HashMap::new();
        for (id, tp) in params.tunnels {
            let mut disallowed = PrefixTrie::new();
            for cidr in &tp.disallowed_ips {
                let (addr, len) = parse_cidr(cidr)?;
                disallowed.insert(addr, len);
            }
            let mut allowed = PrefixTrie::new();
            for cidr in &tp.allowed_ips {
                let (addr, len) = parse_cidr(cidr)?;
                allowed.insert(addr, len);
            }
            let mut disallowed_apps = Vec::new();
            for app in &tp.disallowed_apps {
                disallowed_apps.push(Pattern::parse(app)?);
            }
            tunnels.insert(
                id,
                TunnelFilter {
                    disallowed,
                    allowed_set: !tp.allowed_ips.is_empty(),
                    allowed,
                    disallowed_apps,
                },
            );
        }

        Ok(Self {
            global_disallowed,
            global_allowed_set: !params.allowed_ips.is_empty(),
            global_allowed,
            global_disallowed_apps,
            tunnels,
            local_bypass,
        })
    }

    /// Destination has no route via the physical NIC; sending it to the
    /// direct proxy would only time out.
    pub fn is_local_bypass(&self, ip: Ipv4Addr) -> bool {
        self.local_bypass.contains(ip)
    }

    /// Should this destination bypass the given tunnel?
    ///
    /// Order: global disallowed, per-tunnel disallowed, per-tunnel allowed
    /// (negated when set), global allowed (negated when set).
    pub fn bypass_destination(&self, tunnel_id: Option<&str>, ip: Ipv4Addr) -> bool {
        if self.global_disallowed.contains(ip) {
            return true;
        }
        if let Some(id) = tunnel_id
            && let Some(tf) = self.tunnels.get(id)
        {
            if tf.disallowed.contains(ip) {
                return true;
            }
            if tf.allowed_set && !tf.allowed.contains(ip) {
                return true;
            }
        }
        if self.global_allowed_set && !self.global_allowed.contains(ip) {
            return true;
        }
        false
    }

    pub fn app_disallowed(&self, exe: &str, base: &str) -> bool {
        self.global_disallowed_apps.iter().any(|p| p.matches(exe, base))
    }

    pub fn app_disallowed_for(&self, tunnel_id: &str, exe: &str, base: &str) -> bool {
        self.tunnels
            .get(tunnel_id)
            .is_some_and(|tf| tf.disallowed_apps.iter().any(|p| p.matches(exe, base)))
    }
}
