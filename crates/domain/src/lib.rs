mod fakeip;
mod geodata;
mod ip_table;
mod matcher;

pub use fakeip::{FakeIpPool, FakeIpView};
pub use geodata::{GeoDataDir, GeoIpRules};
pub use matcher::{DomainAction, DomainMatcher, DomainRuleSpec, DomainTarget, MatcherHandle};
pub use ip_table::{DomainIpEntry, DomainIpTable};
