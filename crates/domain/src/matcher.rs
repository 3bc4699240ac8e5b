use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use arc_swap::ArcSwap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainAction {
    Route,
    Block,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainTarget {
    pub action: DomainAction,
    pub tunnel_id: String,
}

/// One domain rule before compilation. `pattern` uses the
/// `full:`/`domain:`/`keyword:` prefixes; a bare name means `domain:`.
#[derive(Debug, Clone)]
pub struct DomainRuleSpec {
    pub pattern: String,
    pub target: DomainTarget,
}

#[derive(Default)]
struct SuffixNode {
    children: HashMap<String, SuffixNode>,
    terminal: Option<DomainTarget>,
}

/// Immutable domain-rule snapshot: exact names, reversed-label suffix trie,
/// keyword substrings. Priority: full > domain > keyword.
pub struct DomainMatcher {
    full: HashMap<String, DomainTarget>,
    suffix_root: SuffixNode,
    keywords: Vec<(String, DomainTarget)>,
}

impl DomainMatcher {
    pub fn empty() -> Self {
        Self {
            full: HashMap::new(),
            suffix_root: SuffixNode::default(),
            keywords: Vec::new(),
        }
    }

    pub fn build(rules: impl IntoIterator<Item = DomainRuleSpec>) -> Result<Self> {
        let mut matcher = Self::empty();
        for rule in rules {
            let pattern = rule.pattern.to_lowercase();
            if let Some(name) = pattern.strip_prefix("full:") {
                matcher.full.insert(canonical(name), rule.target);
            } else if let Some(name) = pattern.strip_prefix("domain:") {
                matcher.insert_suffix(&canonical(name), rule.target)?;
            } else if let Some(word) = pattern.strip_prefix("keyword:") {
                if word.is_empty() {
                    return Err(anyhow!("empty keyword pattern"));
                }
                matcher.keywords.push((word.to_string(), rule.target));
            } else {
                matcher.insert_suffix(&canonical(&pattern), rule.target)?;
            }
        }
        Ok(matcher)
    }

    fn insert_suffix(&mut self, name: &str, target: DomainTarget) -> Result<()> {
        if name.is_empty() {
            return Err(anyhow!("empty domain pattern"));
        }
        let mut node = &mut self.suffix_root;
        for label in name.rsplit('.') {
            node = node.children.entry(label.to_string()).or_default();
        }
        node.terminal = Some(target);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&DomainTarget> {
        let name = canonical(&name.to_lowercase());
        if let Some(target) = self.full.get(&name) {
            return Some(target);
        }

        // Deepest terminal wins: `domain:sub.vk.com` beats `domain:vk.com`.
        let mut node = &self.suffix_root;
        let mut best = None;
        for label in name.rsplit('.') {
            match node.children.get(label) {
                Some(next) => {
                    if next.terminal.is_some() {
                        best = next.terminal.as_ref();
                    }
                    node = next;
                }
                None => break,
            }
        }
        if best.is_some() {
            return best;
        }

        self.keywords
            .iter()
            .find(|(word, _)| name.contains(word.as_str()))
            .map(|(_, target)| target)
    }
}

fn canonical(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_string()
}

/// Hot-swappable matcher pointer; readers load, reload publishes.
pub struct MatcherHandle {
    current: ArcSwap<DomainMatcher>,
}

impl Default for MatcherHandle {
    fn default() -> Self {
        Self::new(DomainMatcher::empty())
    }
}

impl MatcherHandle {
    pub fn new(matcher: DomainMatcher) -> Self {
        Self {
            current: ArcSwap::from_pointee(matcher),
        }
    }

    pub fn load(&self) -> Arc<DomainMatcher> {
        self.current.load_full()
    }

    pub fn swap(&self, matcher: DomainMatcher) {
        self.current.store(Arc::new(matcher));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(action: DomainAction, tunnel: &str) -> DomainTarget {
        DomainTarget {
            action,
            tunnel_id: tunnel.to_string(),
        }
    }

    fn matcher() -> DomainMatcher {
        DomainMatcher::build([
            DomainRuleSpec {
                pattern: "full:exact.example.com".to_string(),
                target: target(DomainAction::Block, ""),
            },
            DomainRuleSpec {
                pattern: "domain:vk.com".to_string(),
                target: target(DomainAction::Route, "tun-a"),
            },
            DomainRuleSpec {
                pattern: "keyword:tracker".to_string(),
                target: target(DomainAction::Direct, ""),
            },
        ])
        .unwrap()
    }

    #[test]
    fn suffix_matches_domain_and_subdomains() {
        let m = matcher();
        assert_eq!(m.lookup("vk.com").unwrap().tunnel_id, "tun-a");
        assert_eq!(m.lookup("sub.vk.com").unwrap().tunnel_id, "tun-a");
        assert_eq!(m.lookup("a.sub.vk.com").unwrap().tunnel_id, "tun-a");
        assert!(m.lookup("notvk.com").is_none());
    }

    #[test]
    fn full_beats_suffix_beats_keyword() {
        let m = DomainMatcher::build([
            DomainRuleSpec {
                pattern: "full:www.example.com".to_string(),
                target: target(DomainAction::Block, ""),
            },
            DomainRuleSpec {
                pattern: "domain:example.com".to_string(),
                target: target(DomainAction::Route, "tun-a"),
            },
            DomainRuleSpec {
                pattern: "keyword:example".to_string(),
                target: target(DomainAction::Direct, ""),
            },
        ])
        .unwrap();
        assert_eq!(m.lookup("www.example.com").unwrap().action, DomainAction::Block);
        assert_eq!(m.lookup("api.example.com").unwrap().action, DomainAction::Route);
        assert_eq!(m.lookup("my-example.net").unwrap().action, DomainAction::Direct);
    }

    #[test]
    fn deepest_suffix_terminal_wins() {
        let m = DomainMatcher::build([
            DomainRuleSpec {
                pattern: "domain:vk.com".to_string(),
                target: target(DomainAction::Route, "tun-a"),
            },
            DomainRuleSpec {
                pattern: "domain:video.vk.com".to_string(),
                target: target(DomainAction::Route, "tun-b"),
            },
        ])
        .unwrap();
        assert_eq!(m.lookup("cdn.video.vk.com").unwrap().tunnel_id, "tun-b");
        assert_eq!(m.lookup("login.vk.com").unwrap().tunnel_id, "tun-a");
    }

    #[test]
    fn lookup_is_case_insensitive_and_strips_trailing_dot() {
        let m = matcher();
        assert!(m.lookup("VK.COM.").is_some());
        assert_eq!(m.lookup("Exact.Example.Com").unwrap().action, DomainAction::Block);
    }

    #[test]
    fn handle_swaps_atomically() {
        let handle = MatcherHandle::new(matcher());
        assert!(handle.load().lookup("vk.com").is_some());
        handle.swap(DomainMatcher::empty());
        assert!(handle.load().lookup("vk.com").is_none());
    }
}
