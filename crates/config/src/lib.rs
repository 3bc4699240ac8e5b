//! YAML configuration model. Loaded once at startup; every invalid input
//! is a fatal error before any network state is touched.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

use splittun_domain::DomainAction;
use splittun_net::parse_cidr;
use splittun_rules::{Fallback, Priority};

pub const DIRECT_ID: &str = "__direct__";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub global_filter: GlobalFilterConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub domain_rules: Vec<DomainRuleConfig>,
    #[serde(default)]
    pub geosite_rules: Vec<GeositeRuleConfig>,
    #[serde(default)]
    pub geoip_rules: Vec<GeoipRuleConfig>,
    #[serde(default)]
    pub fakeip: FakeIpConfig,
    #[serde(default)]
    pub tun: TunConfig,
    #[serde(default = "default_geodata_dir")]
    pub geodata_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub protocol: String,
    #[serde(default)]
    pub settings: TunnelSettings,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub disallowed_ips: Vec<String>,
    #[serde(default)]
    pub disallowed_apps: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSettings {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub interface: Option<String>,
    pub local_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub pattern: String,
    pub tunnel_id: String,
    #[serde(default = "default_fallback")]
    pub fallback: FallbackSpec,
    #[serde(default = "default_priority")]
    pub priority: PrioritySpec,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSpec {
    Block,
    Drop,
    AllowDirect,
    Failover,
}

impl From<FallbackSpec> for Fallback {
    fn from(spec: FallbackSpec) -> Self {
        match spec {
            FallbackSpec::Block => Fallback::Block,
            FallbackSpec::Drop => Fallback::Drop,
            FallbackSpec::AllowDirect => Fallback::AllowDirect,
            FallbackSpec::Failover => Fallback::Failover,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrioritySpec {
    Realtime,
    Normal,
    Low,
    Auto,
}

impl From<PrioritySpec> for Priority {
    fn from(spec: PrioritySpec) -> Self {
        match spec {
            PrioritySpec::Realtime => Priority::Realtime,
            PrioritySpec::Normal => Priority::Normal,
            PrioritySpec::Low => Priority::Low,
            PrioritySpec::Auto => Priority::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpec {
    Route,
    Block,
    Direct,
}

impl From<ActionSpec> for DomainAction {
    fn from(spec: ActionSpec) -> Self {
        match spec {
            ActionSpec::Route => DomainAction::Route,
            ActionSpec::Block => DomainAction::Block,
            ActionSpec::Direct => DomainAction::Direct,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalFilterConfig {
    #[serde(default)]
    pub disallowed_ips: Vec<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub disallowed_apps: Vec<String>,
    #[serde(default)]
    pub disable_local: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    /// Listen address; defaults to the TUN IP, port 53.
    pub listen: Option<String>,
    #[serde(default)]
    pub servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub tunnel_ids: Vec<String>,
    #[serde(default = "default_dns_timeout")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub fallback_direct: bool,
    #[serde(default)]
    pub cache: DnsCacheConfig,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen: None,
            servers: Vec::new(),
            tunnel_ids: Vec::new(),
            timeout: default_dns_timeout(),
            fallback_direct: true,
            cache: DnsCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsCacheConfig {
    #[serde(default = "default_cache_size")]
    pub max_size: usize,
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u64,
    #[serde(default = "default_neg_ttl")]
    pub neg_ttl: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_size(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            neg_ttl: default_neg_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainRuleConfig {
    /// `full:`/`domain:`/`keyword:` pattern; a bare name means `domain:`.
    pub pattern: String,
    #[serde(default)]
    pub tunnel_id: String,
    #[serde(default = "default_action")]
    pub action: ActionSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeositeRuleConfig {
    /// Category name, the `<CATEGORY>` of `geosite:<CATEGORY>`.
    pub category: String,
    #[serde(default)]
    pub tunnel_id: String,
    #[serde(default = "default_action")]
    pub action: ActionSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeoipRuleConfig {
    /// Country code, the `<CC>` of `geoip:<CC>`.
    pub country: String,
    #[serde(default)]
    pub tunnel_id: String,
    #[serde(default = "default_action")]
    pub action: ActionSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FakeIpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fakeip_cidr")]
    pub cidr: String,
}

impl Default for FakeIpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cidr: default_fakeip_cidr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunConfig {
    #[serde(default = "default_tun_name")]
    pub name: String,
    #[serde(default = "default_tun_cidr")]
    pub cidr: String,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            cidr: default_tun_cidr(),
        }
    }
}

fn default_fallback() -> FallbackSpec {
    FallbackSpec::AllowDirect
}
fn default_priority() -> PrioritySpec {
    PrioritySpec::Auto
}
fn default_action() -> ActionSpec {
    ActionSpec::Route
}
fn default_dns_timeout() -> u64 {
    3
}
fn default_true() -> bool {
    true
}
fn default_cache_size() -> usize {
    10_000
}
fn default_min_ttl() -> u64 {
    60
}
fn default_max_ttl() -> u64 {
    3600
}
fn default_neg_ttl() -> u64 {
    30
}
fn default_cleanup_interval() -> u64 {
    60
}
fn default_fakeip_cidr() -> String {
    "198.18.0.0/15".to_string()
}
fn default_tun_name() -> String {
    "tun0".to_string()
}
fn default_tun_cidr() -> String {
    "10.255.0.1/24".to_string()
}
fn default_geodata_dir() -> String {
    "/var/lib/splittun/geodata".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for tunnel in &self.tunnels {
            if tunnel.id.is_empty() {
                return Err(invalid("tunnel id must not be empty"));
            }
            if tunnel.id == DIRECT_ID {
                return Err(invalid(format!("tunnel id {DIRECT_ID} is reserved")));
            }
            if !ids.insert(tunnel.id.as_str()) {
                return Err(invalid(format!("duplicate tunnel id: {}", tunnel.id)));
            }
            for cidr in tunnel
                .allowed_ips
                .iter()
                .chain(&tunnel.disallowed_ips)
            {
                parse_cidr(cidr).map_err(|e| invalid(e.to_string()))?;
            }
        }

        for rule in &self.rules {
            if rule.tunnel_id != DIRECT_ID && !ids.contains(rule.tunnel_id.as_str()) {
                return Err(invalid(format!(
                    "rule {:?} references unknown tunnel {}",
                    rule.pattern, rule.tunnel_id
                )));
            }
        }

        let check_target = |action: ActionSpec, tunnel_id: &str, what: &str| {
            if action == ActionSpec::Route
                && tunnel_id != DIRECT_ID
                && !ids.contains(tunnel_id)
            {
                return Err(invalid(format!(
                    "{what} routes to unknown tunnel {tunnel_id}"
                )));
            }
            Ok(())
        };
        for rule in &self.domain_rules {
            check_target(rule.action, &rule.tunnel_id, &rule.pattern)?;
        }
        for rule in &self.geosite_rules {
            check_target(rule.action, &rule.tunnel_id, &rule.category)?;
        }
        for rule in &self.geoip_rules {
            check_target(rule.action, &rule.tunnel_id, &rule.country)?;
        }

        for id in &self.dns.tunnel_ids {
            if id != DIRECT_ID && !ids.contains(id.as_str()) {
                return Err(invalid(format!("dns references unknown tunnel {id}")));
            }
        }

        if self.fakeip.enabled {
            let (_, prefix) =
                parse_cidr(&self.fakeip.cidr).map_err(|e| invalid(e.to_string()))?;
            if !(1..=30).contains(&prefix) {
                return Err(invalid("fakeip cidr must be between /1 and /30"));
            }
        }

        parse_cidr(&self.tun.cidr).map_err(|e| invalid(e.to_string()))?;
        for cidr in self
            .global_filter
            .allowed_ips
            .iter()
            .chain(&self.global_filter.disallowed_ips)
        {
            parse_cidr(cidr).map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn tun_addr(&self) -> (Ipv4Addr, u8) {
        // Validated above.
        parse_cidr(&self.tun.cidr).unwrap_or((Ipv4Addr::new(10, 255, 0, 1), 24))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
tunnels:
  - id: tun-a
    name: upstream-a
    protocol: http
    settings:
      server: proxy.example.com
      port: 8080
      username: user
      password: secret
    disallowed_ips: ["10.10.0.0/16"]
    disallowed_apps: ["torrent.exe"]
rules:
  - pattern: "chrome.exe"
    tunnel_id: tun-a
    fallback: failover
    priority: realtime
global_filter:
  disallowed_apps: ["updater.exe"]
dns:
  servers: [1.1.1.1, 8.8.8.8]
  tunnel_ids: [tun-a]
  cache:
    max_size: 5000
domain_rules:
  - pattern: "domain:vk.com"
    tunnel_id: tun-a
  - pattern: "full:blocked.example"
    action: block
geoip_rules:
  - country: ru
    tunnel_id: tun-a
fakeip:
  enabled: true
  cidr: "198.18.0.0/15"
tun:
  name: tun7
  cidr: "10.255.0.1/24"
"#;

    #[test]
    fn full_config_parses() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.tunnels.len(), 1);
        assert_eq!(config.rules[0].fallback, FallbackSpec::Failover);
        assert_eq!(config.rules[0].priority, PrioritySpec::Realtime);
        assert_eq!(config.dns.servers.len(), 2);
        assert_eq!(config.dns.cache.max_size, 5000);
        assert_eq!(config.dns.cache.min_ttl, 60);
        assert_eq!(config.domain_rules[1].action, ActionSpec::Block);
        assert!(config.fakeip.enabled);
        assert_eq!(config.tun.name, "tun7");
        assert_eq!(config.tun_addr(), (Ipv4Addr::new(10, 255, 0, 1), 24));
    }

    #[test]
    fn rule_with_unknown_tunnel_is_rejected() {
        let err = Config::parse(
            "rules:\n  - pattern: x\n    tunnel_id: nope\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown tunnel"));
    }

    #[test]
    fn direct_pseudo_tunnel_is_always_known() {
        let config =
            Config::parse("rules:\n  - pattern: x\n    tunnel_id: __direct__\n").unwrap();
        assert_eq!(config.rules[0].tunnel_id, DIRECT_ID);
    }

    #[test]
    fn reserved_and_duplicate_ids_are_rejected() {
        let reserved = "tunnels:\n  - id: __direct__\n    protocol: http\n";
        assert!(Config::parse(reserved).is_err());

        let duplicate = "tunnels:\n  - id: a\n    protocol: http\n  - id: a\n    protocol: http\n";
        assert!(Config::parse(duplicate).is_err());
    }

    #[test]
    fn narrow_fakeip_cidr_is_rejected() {
        let config = "fakeip:\n  enabled: true\n  cidr: \"198.18.0.0/31\"\n";
        assert!(Config::parse(config).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::parse("bogus_key: 1\n").is_err());
    }

    #[test]
    fn defaults_fill_in() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.dns.timeout, 3);
        assert!(config.dns.fallback_direct);
        assert_eq!(config.dns.cache.max_size, 10_000);
        assert!(!config.fakeip.enabled);
        assert_eq!(config.tun.name, "tun0");
    }
}
