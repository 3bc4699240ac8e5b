pub mod checksum;
pub mod clock;
pub mod packet;
pub mod trie;

pub use clock::CoarseClock;
pub use packet::{PacketMeta, Proto};
pub use trie::PrefixTrie;

use std::net::Ipv4Addr;

use anyhow::{Context, Result, anyhow};

/// Parse `A.B.C.D/NN` into (address, prefix length).
pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr_str, prefix_str) = s
        .split_once('/')
        .ok_or_else(|| anyhow!("invalid CIDR (expected A.B.C.D/NN): {s}"))?;
    let addr: Ipv4Addr = addr_str
        .parse()
        .with_context(|| format!("invalid CIDR address: {s}"))?;
    let prefix: u8 = prefix_str
        .parse()
        .with_context(|| format!("invalid CIDR prefix length: {s}"))?;
    if prefix > 32 {
        return Err(anyhow!("invalid CIDR prefix length: {s}"));
    }
    Ok((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cidr_ok() {
        let (addr, prefix) = parse_cidr("198.18.0.0/15").unwrap();
        assert_eq!(addr, Ipv4Addr::new(198, 18, 0, 0));
        assert_eq!(prefix, 15);
    }

    #[test]
    fn parse_cidr_rejects_wide_prefix() {
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.0.0").is_err());
    }
}
