//! Host packet filter: per-executable blocks on the physical interface,
//! bypass permits, DNS steering, IPv6 blocking.
//!
//! The filter holds the desired rule state and rebuilds its single nft
//! table from it on every change, through native libnftnl batches with the
//! `nft` binary as a root-only fallback. Session-scoped: teardown deletes
//! the table.

mod nft;

use std::collections::HashSet;
use std::net::Ipv4Addr;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{info, warn};

use splittun_net::parse_cidr;
use splittun_util::CommandRunner;

pub trait HostFilter: Send + Sync {
    /// Idempotently block this executable on every non-TUN interface
    /// (loopback exempt, bypass-marked sockets exempt).
    fn ensure_blocked(&self, exe_path: &str) -> Result<()>;
    /// Permit rules for bypass CIDRs, higher priority than the per-exe
    /// blocks.
    fn add_bypass_prefixes(&self, prefixes: &[String]) -> Result<()>;
    /// Permit a single destination resolved from a Direct domain rule.
    fn permit_direct_ip(&self, ip: Ipv4Addr) -> Result<()>;
    /// Drop the permit once the domain-IP entry expires.
    fn remove_direct_ip(&self, ip: Ipv4Addr) -> Result<()>;
    fn block_dns_on_interface(&self, interface: &str) -> Result<()>;
    /// Permit the gateway's own (bypass-marked) sockets past the DNS block
    /// and the per-exe drops.
    fn permit_dns_for_self(&self, interface: &str) -> Result<()>;
    fn block_all_ipv6(&self) -> Result<()>;
    fn unblock_all_processes(&self) -> Result<()>;
    /// Reclaim every rule installed this session.
    fn teardown(&self) -> Result<()>;
}

/// No-op backend for tests and unsupported platforms.
#[derive(Default)]
pub struct NoopFilter;

impl HostFilter for NoopFilter {
    fn ensure_blocked(&self, _exe_path: &str) -> Result<()> {
        Ok(())
    }
    fn add_bypass_prefixes(&self, _prefixes: &[String]) -> Result<()> {
        Ok(())
    }
    fn permit_direct_ip(&self, _ip: Ipv4Addr) -> Result<()> {
        Ok(())
    }
    fn remove_direct_ip(&self, _ip: Ipv4Addr) -> Result<()> {
        Ok(())
    }
    fn block_dns_on_interface(&self, _interface: &str) -> Result<()> {
        Ok(())
    }
    fn permit_dns_for_self(&self, _interface: &str) -> Result<()> {
        Ok(())
    }
    fn block_all_ipv6(&self) -> Result<()> {
        Ok(())
    }
    fn unblock_all_processes(&self) -> Result<()> {
        Ok(())
    }
    fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

/// Desired rule state; the nft table is rebuilt from this on every change.
#[derive(Default)]
pub(crate) struct FilterState {
    pub(crate) blocked_exes: HashSet<String>,
    pub(crate) bypass_prefixes: Vec<(Ipv4Addr, u8)>,
    pub(crate) direct_ips: HashSet<Ipv4Addr>,
    pub(crate) dns_blocked_ifs: Vec<String>,
    pub(crate) self_permitted: bool,
    pub(crate) block_ipv6: bool,
}

/// nftables-backed filter. Applies natively via libnftnl/libmnl; when the
/// native path fails and we are root with the nft binary available, the
/// same state is replayed through the CLI.
pub struct NftFilter {
    table: String,
    chain: String,
    tun_name: String,
    bypass_mark: u32,
    runner: CommandRunner,
    state: Mutex<FilterState>,
}

impl NftFilter {
    pub fn new(
        table: String,
        tun_name: String,
        bypass_mark: u32,
        runner: CommandRunner,
    ) -> Result<Self> {
        let filter = Self {
            table,
            chain: "output".to_string(),
            tun_name,
            bypass_mark,
            runner,
            state: Mutex::new(FilterState::default()),
        };
        filter.apply(&filter.state.lock())?;
        info!(table = %filter.table, "host filter table installed");
        Ok(filter)
    }

    fn apply(&self, state: &FilterState) -> Result<()> {
        if let Err(err) = nft::apply_native(
            &self.table,
            &self.chain,
            &self.tun_name,
            self.bypass_mark,
            state,
        ) {
            if splittun_util::is_root() && nft::find_nft_binary() {
                warn!(%err, "native nftables apply failed, replaying via nft command");
                nft::apply_cmd(
                    &self.table,
                    &self.chain,
                    &self.tun_name,
                    self.bypass_mark,
                    state,
                    &self.runner,
                )?;
            } else {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Mutate the desired state; reapply only when something changed.
    fn mutate(&self, change: impl FnOnce(&mut FilterState) -> bool) -> Result<()> {
        let mut state = self.state.lock();
        if change(&mut state) {
            self.apply(&state)?;
        }
        Ok(())
    }
}

impl HostFilter for NftFilter {
    fn ensure_blocked(&self, exe_path: &str) -> Result<()> {
        self.mutate(|state| state.blocked_exes.insert(exe_path.to_string()))
    }

    fn add_bypass_prefixes(&self, prefixes: &[String]) -> Result<()> {
        let mut parsed = Vec::new();
        for prefix in prefixes {
            let (addr, len) = parse_cidr(prefix)?;
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
            parsed.push((Ipv4Addr::from(u32::from(addr) & mask), len));
        }
        self.mutate(move |state| {
            let mut changed = false;
            for entry in parsed {
                if !state.bypass_prefixes.contains(&entry) {
                    state.bypass_prefixes.push(entry);
                    changed = true;
                }
            }
            changed
        })
    }

    fn permit_direct_ip(&self, ip: Ipv4Addr) -> Result<()> {
        self.mutate(|state| state.direct_ips.insert(ip))
    }

    fn remove_direct_ip(&self, ip: Ipv4Addr) -> Result<()> {
        self.mutate(|state| state.direct_ips.remove(&ip))
    }

    fn block_dns_on_interface(&self, interface: &str) -> Result<()> {
        self.mutate(|state| {
            if state.dns_blocked_ifs.iter().any(|i| i == interface) {
                false
            } else {
                state.dns_blocked_ifs.push(interface.to_string());
                true
            }
        })
    }

    fn permit_dns_for_self(&self, _interface: &str) -> Result<()> {
        // The accept rule keys on the bypass mark, so it covers the
        // gateway's sockets on every interface.
        self.mutate(|state| {
            let changed = !state.self_permitted;
            state.self_permitted = true;
            changed
        })
    }

    fn block_all_ipv6(&self) -> Result<()> {
        self.mutate(|state| {
            let changed = !state.block_ipv6;
            state.block_ipv6 = true;
            changed
        })
    }

    fn unblock_all_processes(&self) -> Result<()> {
        self.mutate(|state| {
            let had_any = !state.blocked_exes.is_empty();
            state.blocked_exes.clear();
            had_any
        })
    }

    fn teardown(&self) -> Result<()> {
        match nft::delete_table(&self.table) {
            Ok(()) => Ok(()),
            Err(err) => {
                if splittun_util::is_root() && nft::find_nft_binary() {
                    warn!(%err, "native nft delete failed, falling back to nft command");
                    let _ = self
                        .runner
                        .run_capture_allow_fail("nft", &["delete", "table", "inet", &self.table]);
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}
