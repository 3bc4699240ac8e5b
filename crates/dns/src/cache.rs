use std::collections::HashMap;

use parking_lot::RwLock;

use splittun_net::CoarseClock;

use crate::wire;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: usize,
    pub min_ttl: u64,
    pub max_ttl: u64,
    pub neg_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            min_ttl: 60,
            max_ttl: 3600,
            neg_ttl: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Lowercased qname.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

struct CacheEntry {
    response: Vec<u8>,
    rr_offset: usize,
    stored_at: u64,
    expires_at: u64,
}

/// Response cache keyed by (qname, qtype, qclass), serving raw bytes with
/// the transaction id rewritten and TTLs decremented by age.
pub struct DnsCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    cfg: CacheConfig,
    clock: CoarseClock,
}

impl DnsCache {
    pub fn new(cfg: CacheConfig, clock: CoarseClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cfg,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Store a response if it is cacheable: not truncated, exactly one
    /// question, and RCODE NOERROR or NXDOMAIN (negative TTL).
    pub fn put(&self, key: CacheKey, response: &[u8]) {
        if wire::is_truncated(response) || wire::qdcount(response) != 1 {
            return;
        }
        let Ok(question) = wire::parse_question(response) else {
            return;
        };
        let ttl = match wire::rcode(response) {
            wire::RCODE_NOERROR => {
                let raw = wire::min_ttl(response, question.rr_offset).unwrap_or(0);
                u64::from(raw).clamp(self.cfg.min_ttl, self.cfg.max_ttl)
            }
            wire::RCODE_NXDOMAIN => self.cfg.neg_ttl,
            _ => return,
        };

        let now = self.clock.now();
        let mut entries = self.entries.write();
        if entries.len() >= self.cfg.max_size && !entries.contains_key(&key) {
            evict_one(&mut entries, now);
        }
        entries.insert(
            key,
            CacheEntry {
                response: response.to_vec(),
                rr_offset: question.rr_offset,
                stored_at: now,
                expires_at: now + ttl,
            },
        );
    }

    /// Serve a hit: clone the stored bytes, swap in the query's transaction
    /// id, and age the TTLs by the entry's time in cache.
    pub fn get(&self, key: &CacheKey, query_id: u16) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.expires_at <= now {
            return None;
        }
        let mut response = entry.response.clone();
        wire::set_txid(&mut response, query_id);
        let elapsed = (now - entry.stored_at) as u32;
        if elapsed > 0 {
            wire::decrement_ttls(&mut response, entry.rr_offset, elapsed);
        }
        Some(response)
    }
}

/// One expired-entry pass; if nothing is expired, drop the entry closest to
/// expiry.
fn evict_one(entries: &mut HashMap<CacheKey, CacheEntry>, now: u64) {
    let before = entries.len();
    entries.retain(|_, e| e.expires_at > now);
    if entries.len() < before {
        return;
    }
    if let Some(key) = entries
        .iter()
        .min_by_key(|(_, e)| e.expires_at)
        .map(|(k, _)| k.clone())
    {
        entries.remove(&key);
    }
}
