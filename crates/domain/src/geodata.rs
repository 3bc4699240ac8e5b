//! Loaders for cached geosite/geoip category files.
//!
//! Categories live on disk as one file per category:
//! `geosite/<CATEGORY>.list` holds `full:`/`domain:`/`keyword:` lines,
//! `geoip/<CC>.list` holds CIDR lines. The upstream protobuf bundles are
//! converted into this layout when refreshed.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};

use splittun_net::{PrefixTrie, parse_cidr};

use crate::matcher::{DomainAction, DomainRuleSpec, DomainTarget};

pub struct GeoDataDir {
    root: PathBuf,
}

impl GeoDataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Expand `geosite:<CATEGORY>` into plain domain rules.
    pub fn geosite_rules(&self, category: &str, target: DomainTarget) -> Result<Vec<DomainRuleSpec>> {
        let path = self
            .root
            .join("geosite")
            .join(format!("{}.list", category.to_lowercase()));
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("missing geosite category file: {}", path.display()))?;
        let mut rules = Vec::new();
        for line in list_lines(&data) {
            rules.push(DomainRuleSpec {
                pattern: line.to_string(),
                target: target.clone(),
            });
        }
        Ok(rules)
    }

    pub fn geoip_cidrs(&self, country: &str) -> Result<Vec<(Ipv4Addr, u8)>> {
        let path = self
            .root
            .join("geoip")
            .join(format!("{}.list", country.to_lowercase()));
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("missing geoip country file: {}", path.display()))?;
        let mut cidrs = Vec::new();
        for line in list_lines(&data) {
            cidrs.push(parse_cidr(line)?);
        }
        Ok(cidrs)
    }
}

fn list_lines(data: &str) -> impl Iterator<Item = &str> {
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

struct GeoIpEntry {
    country: String,
    trie: PrefixTrie,
    target: DomainTarget,
}

/// Destination-IP rules expanded from `geoip:<CC>` patterns, checked in
/// declaration order.
#[derive(Default)]
pub struct GeoIpRules {
    entries: Vec<GeoIpEntry>,
}

impl GeoIpRules {
    pub fn add(&mut self, country: &str, cidrs: &[(Ipv4Addr, u8)], target: DomainTarget) {
        let mut trie = PrefixTrie::new();
        for (addr, len) in cidrs {
            trie.insert(*addr, *len);
        }
        self.entries.push(GeoIpEntry {
            country: country.to_lowercase(),
            trie,
            target,
        });
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<(&str, &DomainTarget)> {
        self.entries
            .iter()
            .find(|e| e.trie.contains(ip))
            .map(|e| (e.country.as_str(), &e.target))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
