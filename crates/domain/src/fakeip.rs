//! Synthetic per-domain IPv4 pool.
//!
//! A ring allocator hands out addresses from the configured CIDR. Under
//! pressure, eviction walks the ring from the allocation cursor and takes
//! the first entry with no active flows; entries pinned by in-flight
//! connections are skipped. Allocation fails only when every slot is
//! pinned.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;

use crate::matcher::DomainAction;

struct Slot {
    domain: String,
    real_ips: Vec<Ipv4Addr>,
    tunnel_id: String,
    action: DomainAction,
    active_flows: Arc<AtomicU32>,
}

struct PoolInner {
    slots: Vec<Option<Slot>>,
    by_domain: HashMap<String, usize>,
    by_real: HashMap<Ipv4Addr, usize>,
    cursor: usize,
}

#[derive(Debug, Clone)]
pub struct FakeIpView {
    pub fake_ip: Ipv4Addr,
    pub domain: String,
    pub real_ips: Vec<Ipv4Addr>,
    pub tunnel_id: String,
    pub action: DomainAction,
}

pub struct FakeIpPool {
    base: u32,
    total: u64,
    size: usize,
    inner: Mutex<PoolInner>,
}

impl FakeIpPool {
    /// `prefix` must leave room for at least two usable addresses; the
    /// network and broadcast addresses are reserved.
    pub fn new(cidr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if !(1..=30).contains(&prefix) {
            return Err(anyhow!("fakeip CIDR prefix must be between /1 and /30"));
        }
        let mask = u32::MAX << (32 - prefix);
        let base = u32::from(cidr) & mask;
        let total = 1u64 << (32 - prefix);
        let size = (total - 2) as usize;
        Ok(Self {
            base,
            total,
            size,
            inner: Mutex::new(PoolInner {
                slots: (0..size).map(|_| None).collect(),
                by_domain: HashMap::new(),
                by_real: HashMap::new(),
                cursor: 0,
            }),
        })
    }

    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        let v = u64::from(u32::from(ip));
        v >= u64::from(self.base) && v < u64::from(self.base) + self.total
    }

    fn ip_of(&self, index: usize) -> Ipv4Addr {
        Ipv4Addr::from(self.base + 1 + index as u32)
    }

    fn index_of(&self, ip: Ipv4Addr) -> Option<usize> {
        let v = u32::from(ip);
        let first = self.base + 1;
        if v < first || v >= first + self.size as u32 {
            return None;
        }
        Some((v - first) as usize)
    }

    /// Allocate (or refresh) the synthetic address for a domain.
    pub fn alloc(
        &self,
        domain: &str,
        real_ips: Vec<Ipv4Addr>,
        tunnel_id: String,
        action: DomainAction,
    ) -> Result<Ipv4Addr> {
        let domain = domain.to_lowercase();
        let mut inner = self.inner.lock();

        if let Some(&index) = inner.by_domain.get(&domain) {
            let old_real: Vec<Ipv4Addr> = inner.slots[index]
                .as_ref()
                .map(|s| s.real_ips.clone())
                .unwrap_or_default();
            for ip in old_real {
                inner.by_real.remove(&ip);
            }
            for ip in &real_ips {
                inner.by_real.insert(*ip, index);
            }
            if let Some(slot) = inner.slots[index].as_mut() {
                slot.real_ips = real_ips;
                slot.tunnel_id = tunnel_id;
                slot.action = action;
            }
            return Ok(self.ip_of(index));
        }

        let index = self
            .free_slot(&inner)
            .or_else(|| self.evict_slot(&mut inner))
            .ok_or_else(|| anyhow!("fakeip pool exhausted: all {} slots have active flows", self.size))?;

        for ip in &real_ips {
            inner.by_real.insert(*ip, index);
        }
        inner.by_domain.insert(domain.clone(), index);
        inner.slots[index] = Some(Slot {
            domain,
            real_ips,
            tunnel_id,
            action,
            active_flows: Arc::new(AtomicU32::new(0)),
        });
        inner.cursor = (index + 1) % self.size;
        Ok(self.ip_of(index))
    }

    fn free_slot(&self, inner: &PoolInner) -> Option<usize> {
        (0..self.size)
            .map(|off| (inner.cursor + off) % self.size)
            .find(|&idx| inner.slots[idx].is_none())
    }

    fn evict_slot(&self, inner: &mut PoolInner) -> Option<usize> {
        let victim = (0..self.size)
            .map(|off| (inner.cursor + off) % self.size)
            .find(|&idx| {
                inner.slots[idx]
                    .as_ref()
                    .is_some_and(|s| s.active_flows.load(Ordering::Relaxed) == 0)
            })?;
        let slot = inner.slots[victim].take().expect("victim slot occupied");
        inner.by_domain.remove(&slot.domain);
        for ip in &slot.real_ips {
            inner.by_real.remove(ip);
        }
        Some(victim)
    }

    pub fn lookup(&self, fake_ip: Ipv4Addr) -> Option<FakeIpView> {
        let index = self.index_of(fake_ip)?;
        let inner = self.inner.lock();
        let slot = inner.slots[index].as_ref()?;
        Some(self.view(fake_ip, slot))
    }

    pub fn lookup_domain(&self, domain: &str) -> Option<Ipv4Addr> {
        let inner = self.inner.lock();
        inner
            .by_domain
            .get(&domain.to_lowercase())
            .map(|&index| self.ip_of(index))
    }

    /// Fallback lookup for connections that bypassed the fake answer and
    /// went to a real address.
    pub fn lookup_real(&self, real_ip: Ipv4Addr) -> Option<FakeIpView> {
        let inner = self.inner.lock();
        let &index = inner.by_real.get(&real_ip)?;
        let slot = inner.slots[index].as_ref()?;
        Some(self.view(self.ip_of(index), slot))
    }

    fn view(&self, fake_ip: Ipv4Addr, slot: &Slot) -> FakeIpView {
        FakeIpView {
            fake_ip,
            domain: slot.domain.clone(),
            real_ips: slot.real_ips.clone(),
            tunnel_id: slot.tunnel_id.clone(),
            action: slot.action,
        }
    }

    /// Pin the entry against eviction while a flow is in flight.
    pub fn inc_flows(&self, fake_ip: Ipv4Addr) {
        if let Some(flows) = self.flows_of(fake_ip) {
            flows.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dec_flows(&self, fake_ip: Ipv4Addr) {
        if let Some(flows) = self.flows_of(fake_ip) {
            let _ = flows.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                v.checked_sub(1)
            });
        }
    }

    fn flows_of(&self, fake_ip: Ipv4Addr) -> Option<Arc<AtomicU32>> {
        let index = self.index_of(fake_ip)?;
        let inner = self.inner.lock();
        inner.slots[index].as_ref().map(|s| Arc::clone(&s.active_flows))
    }

    /// Drop every mapping (rule reload). In-flight flows carry their
    /// resolved destinations and continue against the stale mapping until
    /// they expire.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.slots = (0..self.size).map(|_| None).collect();
        inner.by_domain.clear();
        inner.by_real.clear();
        inner.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(prefix: u8) -> FakeIpPool {
        FakeIpPool::new(Ipv4Addr::new(198, 18, 0, 0), prefix).unwrap()
    }

    #[test]
    fn rejects_narrow_cidr() {
        assert!(FakeIpPool::new(Ipv4Addr::new(198, 18, 0, 0), 31).is_err());
        assert!(FakeIpPool::new(Ipv4Addr::new(198, 18, 0, 0), 30).is_ok());
    }

    #[test]
    fn same_domain_reuses_address() {
        let pool = pool(24);
        let a = pool
            .alloc("example.com", vec![Ipv4Addr::new(93, 184, 216, 34)], "tun-a".into(), DomainAction::Route)
            .unwrap();
        let b = pool
            .alloc("EXAMPLE.com", vec![Ipv4Addr::new(93, 184, 216, 35)], "tun-a".into(), DomainAction::Route)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, Ipv4Addr::new(198, 18, 0, 1));
        // Refresh replaced the real addresses.
        assert_eq!(pool.lookup(a).unwrap().real_ips, vec![Ipv4Addr::new(93, 184, 216, 35)]);
    }

    #[test]
    fn reserved_addresses_are_never_allocated() {
        let pool = pool(30);
        let a = pool
            .alloc("a.example", vec![], "tun-a".into(), DomainAction::Route)
            .unwrap();
        let b = pool
            .alloc("b.example", vec![], "tun-a".into(), DomainAction::Route)
            .unwrap();
        assert_eq!(a, Ipv4Addr::new(198, 18, 0, 1));
        assert_eq!(b, Ipv4Addr::new(198, 18, 0, 2));
    }

    #[test]
    fn eviction_skips_entries_with_active_flows() {
        let pool = pool(30); // two slots
        let a = pool
            .alloc("a.example", vec![], "tun-a".into(), DomainAction::Route)
            .unwrap();
        let b = pool
            .alloc("b.example", vec![], "tun-a".into(), DomainAction::Route)
            .unwrap();
        pool.inc_flows(a);

        // Pool is full; `a` is pinned, so `c` takes `b`'s slot.
        let c = pool
            .alloc("c.example", vec![], "tun-a".into(), DomainAction::Route)
            .unwrap();
        assert_eq!(c, b);
        assert!(pool.lookup_domain("b.example").is_none());
        assert_eq!(pool.lookup(a).unwrap().domain, "a.example");
    }

    #[test]
    fn allocation_fails_only_when_all_pinned() {
        let pool = pool(30);
        let a = pool
            .alloc("a.example", vec![], "tun-a".into(), DomainAction::Route)
            .unwrap();
        let b = pool
            .alloc("b.example", vec![], "tun-a".into(), DomainAction::Route)
            .unwrap();
        pool.inc_flows(a);
        pool.inc_flows(b);
        assert!(pool
            .alloc("c.example", vec![], "tun-a".into(), DomainAction::Route)
            .is_err());

        pool.dec_flows(b);
        assert!(pool
            .alloc("c.example", vec![], "tun-a".into(), DomainAction::Route)
            .is_ok());
    }

    #[test]
    fn real_ip_fallback_lookup() {
        let pool = pool(24);
        let real = Ipv4Addr::new(93, 184, 216, 34);
        let fake = pool
            .alloc("example.com", vec![real], "tun-a".into(), DomainAction::Route)
            .unwrap();
        let view = pool.lookup_real(real).unwrap();
        assert_eq!(view.fake_ip, fake);
        assert_eq!(view.domain, "example.com");
    }

    #[test]
    fn flush_clears_mappings() {
        let pool = pool(24);
        let fake = pool
            .alloc("example.com", vec![], "tun-a".into(), DomainAction::Route)
            .unwrap();
        pool.flush();
        assert!(pool.lookup(fake).is_none());
        assert!(pool.lookup_domain("example.com").is_none());
    }
}
