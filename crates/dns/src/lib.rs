mod cache;
mod resolver;
pub mod wire;

pub use cache::{CacheConfig, CacheKey, DnsCache};
pub use resolver::{DnsCounters, DnsService, LAST_RESORT_SERVERS, ResolverConfig};
