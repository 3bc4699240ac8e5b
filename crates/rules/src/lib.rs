mod filter;
mod pattern;
mod process;
mod rule;

pub use filter::{IpFilter, IpFilterParams, TunnelFilterParams, LOCAL_BYPASS_CIDRS};
pub use pattern::Pattern;
pub use process::{ExeInfo, ProcessIndex, ProcfsIndex};
pub use rule::{Fallback, Priority, Rule, RuleSet, RulesHandle};
