mod jitter;
mod stats;

pub use jitter::JitterProbe;
pub use stats::{DropCounter, SlowPathTimer, StatsRegistry, TunnelStats};
