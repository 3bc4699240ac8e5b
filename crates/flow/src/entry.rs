use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use splittun_rules::{Fallback, Priority};

pub const TCP_IDLE_SECS: u64 = 300;
pub const UDP_IDLE_SECS: u64 = 120;
pub const UDP_DNS_IDLE_SECS: u64 = 10;
pub const RAW_IDLE_SECS: u64 = 300;

// Rewinding last-activity by (TCP_IDLE_SECS - 2) makes the next 30 s sweep
// reap a both-FIN entry within a 2 s grace. Tied to TCP_IDLE_SECS; change
// them together.
const FIN_BOTH_REWIND: u64 = TCP_IDLE_SECS - 2;

pub const FIN_CLIENT: u8 = 0x1;
pub const FIN_SERVER: u8 = 0x2;

/// Connection-level failover state carried by the NAT entry so the proxy can
/// resume rule matching where classification stopped.
#[derive(Debug, Clone)]
pub struct FailoverCtx {
    pub exe: String,
    pub base: String,
    pub rule_index: usize,
    pub fallback: Fallback,
}

#[derive(Debug)]
pub struct TcpNat {
    pub orig_dst: Ipv4Addr,
    pub orig_dst_port: u16,
    pub tunnel_id: String,
    pub proxy_port: u16,
    pub failover: Option<FailoverCtx>,
    /// Real destination when `orig_dst` is a FakeIP.
    pub resolved_dst: Option<Ipv4Addr>,
    last_activity: AtomicU64,
    fin_state: AtomicU8,
}

impl TcpNat {
    pub fn new(
        orig_dst: Ipv4Addr,
        orig_dst_port: u16,
        tunnel_id: String,
        proxy_port: u16,
        failover: Option<FailoverCtx>,
        resolved_dst: Option<Ipv4Addr>,
        now: u64,
    ) -> Self {
        Self {
            orig_dst,
            orig_dst_port,
            tunnel_id,
            proxy_port,
            failover,
            resolved_dst,
            last_activity: AtomicU64::new(now),
            fin_state: AtomicU8::new(0),
        }
    }

    pub fn touch(&self, now: u64) {
        self.last_activity.store(now, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn fin_state(&self) -> u8 {
        self.fin_state.load(Ordering::Relaxed)
    }

    /// Record a FIN from one side. Once both sides have closed, the entry is
    /// scheduled for the short-grace reap.
    pub fn mark_fin(&self, side: u8, now: u64) {
        let prev = self.fin_state.fetch_or(side, Ordering::Relaxed);
        if (prev | side) == (FIN_CLIENT | FIN_SERVER) {
            self.last_activity
                .store(now.saturating_sub(FIN_BOTH_REWIND), Ordering::Relaxed);
        }
    }

    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.last_activity()) >= TCP_IDLE_SECS
    }
}

#[derive(Debug)]
pub struct UdpNat {
    pub orig_dst: Ipv4Addr,
    pub orig_dst_port: u16,
    pub tunnel_id: String,
    pub proxy_port: u16,
    pub failover: Option<FailoverCtx>,
    pub resolved_dst: Option<Ipv4Addr>,
    last_activity: AtomicU64,
}

impl UdpNat {
    pub fn new(
        orig_dst: Ipv4Addr,
        orig_dst_port: u16,
        tunnel_id: String,
        proxy_port: u16,
        failover: Option<FailoverCtx>,
        resolved_dst: Option<Ipv4Addr>,
        now: u64,
    ) -> Self {
        Self {
            orig_dst,
            orig_dst_port,
            tunnel_id,
            proxy_port,
            failover,
            resolved_dst,
            last_activity: AtomicU64::new(now),
        }
    }

    pub fn touch(&self, now: u64) {
        self.last_activity.store(now, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn is_stale(&self, now: u64) -> bool {
        let idle = if self.orig_dst_port == 53 {
            UDP_DNS_IDLE_SECS
        } else {
            UDP_IDLE_SECS
        };
        now.saturating_sub(self.last_activity()) >= idle
    }
}

/// Flow served by a raw-capable tunnel, bypassing the hairpin proxies.
#[derive(Debug)]
pub struct RawFlow {
    pub tunnel_id: String,
    pub vpn_ip: Ipv4Addr,
    pub priority: Priority,
    pub auto_priority: bool,
    /// Original synthetic destination when the flow targeted a FakeIP.
    pub fake_dst: Option<Ipv4Addr>,
    pub resolved_dst: Option<Ipv4Addr>,
    last_activity: AtomicU64,
}

impl RawFlow {
    pub fn new(
        tunnel_id: String,
        vpn_ip: Ipv4Addr,
        priority: Priority,
        auto_priority: bool,
        fake_dst: Option<Ipv4Addr>,
        resolved_dst: Option<Ipv4Addr>,
        now: u64,
    ) -> Self {
        Self {
            tunnel_id,
            vpn_ip,
            priority,
            auto_priority,
            fake_dst,
            resolved_dst,
            last_activity: AtomicU64::new(now),
        }
    }

    pub fn touch(&self, now: u64) {
        self.last_activity.store(now, Ordering::Relaxed);
    }

    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.last_activity.load(Ordering::Relaxed)) >= RAW_IDLE_SECS
    }
}
