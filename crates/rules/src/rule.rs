use anyhow::Result;

use crate::pattern::Pattern;

/// What to do when the selected tunnel cannot serve a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Block,
    Drop,
    AllowDirect,
    Failover,
}

/// Rule-level egress priority. `Auto` defers to per-packet classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Realtime,
    Normal,
    Low,
    Auto,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub index: usize,
    pub pattern: Pattern,
    pub tunnel_id: String,
    pub fallback: Fallback,
    pub priority: Priority,
}

/// Ordered rule list; first match wins, failover resumes after an index.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn build(
        entries: impl IntoIterator<Item = (String, String, Fallback, Priority)>,
    ) -> Result<Self> {
        let mut rules = Vec::new();
        for (index, (pattern, tunnel_id, fallback, priority)) in
            entries.into_iter().enumerate()
        {
            rules.push(Rule {
                index,
                pattern: Pattern::parse(&pattern)?,
                tunnel_id,
                fallback,
                priority,
            });
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, exe: &str, base: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.pattern.matches(exe, base))
    }

    /// Resume matching after `after`; used by failover traversal.
    pub fn matches_after(&self, exe: &str, base: &str, after: usize) -> Option<&Rule> {
        self.rules
            .iter()
            .skip(after + 1)
            .find(|r| r.pattern.matches(exe, base))
    }
}

/// Hot-swappable rule list pointer: the classifier and the failover path
/// read it per flow, reload publishes a new set atomically.
pub struct RulesHandle {
    current: arc_swap::ArcSwap<RuleSet>,
}

impl Default for RulesHandle {
    fn default() -> Self {
        Self::new(RuleSet::default())
    }
}

impl RulesHandle {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: arc_swap::ArcSwap::from_pointee(rules),
        }
    }

    pub fn load(&self) -> std::sync::Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn swap(&self, rules: RuleSet) {
        self.current.store(std::sync::Arc::new(rules));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ruleset() -> RuleSet {
        RuleSet::build([
            (
                "regex:.*/video.*".to_string(),
                "tun-a".to_string(),
                Fallback::Failover,
                Priority::Auto,
            ),
            (
                "regex:.*/video.*".to_string(),
                "tun-b".to_string(),
                Fallback::AllowDirect,
                Priority::Normal,
            ),
            (
                "chrome.exe".to_string(),
                "tun-c".to_string(),
                Fallback::Block,
                Priority::Realtime,
            ),
        ])
        .unwrap()
    }

    #[test]
    fn first_match_wins() {
        let rules = ruleset();
        let hit = rules.matches("/usr/bin/video-app", "video-app").unwrap();
        assert_eq!(hit.index, 0);
        assert_eq!(hit.tunnel_id, "tun-a");
    }

    #[test]
    fn matches_after_skips_earlier_rules() {
        let rules = ruleset();
        let hit = rules.matches_after("/usr/bin/video-app", "video-app", 0).unwrap();
        assert_eq!(hit.index, 1);
        assert_eq!(hit.tunnel_id, "tun-b");
        assert!(rules.matches_after("/usr/bin/video-app", "video-app", 1).is_none());
    }

    #[test]
    fn no_match_returns_none() {
        let rules = ruleset();
        assert!(rules.matches("/usr/bin/audio", "audio").is_none());
    }
}
