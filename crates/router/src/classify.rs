use std::net::Ipv4Addr;

use tracing::debug;

use splittun_domain::DomainAction;
use splittun_flow::FailoverCtx;
use splittun_net::PacketMeta;
use splittun_rules::{Fallback, Priority, Rule};

use crate::router::Router;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowVerdict {
    Drop,
    Pass,
    Route,
}

#[derive(Debug)]
pub struct Decision {
    pub verdict: FlowVerdict,
    pub tunnel_id: Option<String>,
    pub priority: Priority,
    pub failover: Option<FailoverCtx>,
    /// Real destination when the packet targets a FakeIP.
    pub resolved_dst: Option<Ipv4Addr>,
    pub fake_dst: Option<Ipv4Addr>,
}

impl Decision {
    fn drop() -> Self {
        Self {
            verdict: FlowVerdict::Drop,
            tunnel_id: None,
            priority: Priority::Normal,
            failover: None,
            resolved_dst: None,
            fake_dst: None,
        }
    }

    fn pass() -> Self {
        Self {
            verdict: FlowVerdict::Pass,
            ..Self::drop()
        }
    }

    fn route(tunnel_id: String, priority: Priority, failover: Option<FailoverCtx>) -> Self {
        Self {
            verdict: FlowVerdict::Route,
            tunnel_id: Some(tunnel_id),
            priority,
            failover,
            resolved_dst: None,
            fake_dst: None,
        }
    }
}

impl Router {
    /// Decide what happens to a new flow. Total: every path ends in a
    /// verdict, and the failover walk is bounded by the rule count.
    pub(crate) fn classify(&self, meta: &PacketMeta) -> Decision {
        // Destinations with no route via the physical NIC would only time
        // out inside the direct proxy.
        if self.filter.is_local_bypass(meta.dst) {
            return Decision::drop();
        }

        // Synthetic destinations resolve through the pool.
        if let Some(pool) = &self.fakeip
            && pool.in_range(meta.dst)
        {
            let Some(view) = pool.lookup(meta.dst) else {
                // Stale synthetic address with no mapping left.
                return Decision::drop();
            };
            let resolved = view.real_ips.first().copied();
            match view.action {
                DomainAction::Block => return Decision::drop(),
                DomainAction::Direct => {
                    let mut d = Decision::pass();
                    d.resolved_dst = resolved;
                    d.fake_dst = Some(meta.dst);
                    return d;
                }
                DomainAction::Route => {
                    if self.registry.is_up(&view.tunnel_id) {
                        let mut d = Decision::route(view.tunnel_id, Priority::Auto, None);
                        d.resolved_dst = resolved;
                        d.fake_dst = Some(meta.dst);
                        return d;
                    }
                }
            }
        }

        // Domain-table hit from an earlier matched DNS answer.
        if let Some(entry) = self.domain_ip.get(meta.dst) {
            match entry.action {
                DomainAction::Block => return Decision::drop(),
                DomainAction::Direct => return Decision::pass(),
                DomainAction::Route => {
                    if self.registry.is_up(&entry.tunnel_id) {
                        return Decision::route(entry.tunnel_id, Priority::Auto, None);
                    }
                }
            }
        }

        // Country-level destination rules.
        if let Some((country, target)) = self.geoip.lookup(meta.dst) {
            match target.action {
                DomainAction::Block => return Decision::drop(),
                DomainAction::Direct => return Decision::pass(),
                DomainAction::Route => {
                    if self.registry.is_up(&target.tunnel_id) {
                        debug!(%country, tunnel = %target.tunnel_id, "geoip route");
                        return Decision::route(
                            target.tunnel_id.clone(),
                            Priority::Auto,
                            None,
                        );
                    }
                }
            }
        }

        let Some(pid) = self.process.owner_pid(meta.proto, meta.src_port) else {
            return Decision::pass();
        };
        // Our own sockets must never re-enter the TUN.
        if pid == self.self_pid {
            return Decision::drop();
        }
        let Some(exe) = self.process.exe_of(pid) else {
            return Decision::pass();
        };
        if self.filter.app_disallowed(&exe.exe, &exe.base) {
            return Decision::pass();
        }

        let rules = self.rules.load();
        let Some(first) = rules.matches(&exe.exe, &exe.base) else {
            return Decision::pass();
        };

        // Bounded by the rule count: each iteration advances the cursor.
        let mut rule: &Rule = first;
        for _ in 0..rules.len() {
            // A drop rule blocks the executable outright.
            if rule.fallback == Fallback::Drop {
                return Decision::drop();
            }
            if self.filter.app_disallowed_for(&rule.tunnel_id, &exe.exe, &exe.base) {
                return Decision::pass();
            }
            if !self.registry.is_up(&rule.tunnel_id) {
                match rule.fallback {
                    Fallback::Failover => {
                        match rules.matches_after(&exe.exe, &exe.base, rule.index) {
                            Some(next) => {
                                rule = next;
                                continue;
                            }
                            None => return Decision::pass(),
                        }
                    }
                    Fallback::Block | Fallback::Drop => return Decision::drop(),
                    Fallback::AllowDirect => return Decision::pass(),
                }
            }
            if self
                .filter
                .bypass_destination(Some(&rule.tunnel_id), meta.dst)
            {
                return Decision::pass();
            }
            // Lazily pin the executable off the physical NIC.
            if let Err(err) = self.host_filter.ensure_blocked(&exe.exe) {
                debug!(exe = %exe.exe, %err, "host filter block failed");
            }
            return Decision::route(
                rule.tunnel_id.clone(),
                rule.priority,
                Some(FailoverCtx {
                    exe: exe.exe.clone(),
                    base: exe.base.clone(),
                    rule_index: rule.index,
                    fallback: rule.fallback,
                }),
            );
        }
        Decision::pass()
    }
}
