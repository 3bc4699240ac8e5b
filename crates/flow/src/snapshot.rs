//! Copy-on-write membership maps with lock-free readers.
//!
//! Mutations are rare (tunnel registration, reload); reads happen per
//! packet. Writers serialize on a small mutex, clone the snapshot, and
//! publish the new map through an atomic pointer swap.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

/// Set of proxy listener ports (one instance for TCP, one for UDP).
pub struct PortSet {
    current: ArcSwap<HashSet<u16>>,
    write: Mutex<()>,
}

impl Default for PortSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PortSet {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(HashSet::new()),
            write: Mutex::new(()),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.current.load().contains(&port)
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    pub fn add(&self, port: u16) {
        let _guard = self.write.lock();
        let mut next = HashSet::clone(&self.current.load());
        next.insert(port);
        self.current.store(Arc::new(next));
    }

    pub fn remove(&self, port: u16) {
        let _guard = self.write.lock();
        let mut next = HashSet::clone(&self.current.load());
        next.remove(&port);
        self.current.store(Arc::new(next));
    }
}

/// VPN adapter IP to tunnel id, consulted for every inbound raw packet.
pub struct VpnIpMap {
    current: ArcSwap<HashMap<Ipv4Addr, String>>,
    write: Mutex<()>,
}

impl Default for VpnIpMap {
    fn default() -> Self {
        Self::new()
    }
}

impl VpnIpMap {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(HashMap::new()),
            write: Mutex::new(()),
        }
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<String> {
        self.current.load().get(&ip).cloned()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.current.load().contains_key(&ip)
    }

    pub fn set(&self, ip: Ipv4Addr, tunnel_id: String) {
        let _guard = self.write.lock();
        let mut next = HashMap::clone(&self.current.load());
        next.insert(ip, tunnel_id);
        self.current.store(Arc::new(next));
    }

    pub fn remove(&self, ip: Ipv4Addr) {
        let _guard = self.write.lock();
        let mut next = HashMap::clone(&self.current.load());
        next.remove(&ip);
        self.current.store(Arc::new(next));
    }
}
