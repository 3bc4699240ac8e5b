use tracing::warn;

use splittun_hostfilter::HostFilter;
use splittun_tunnel::{TunnelRegistry, TunnelState};

/// Best-effort shutdown: disconnect providers, reclaim filter rules. Each
/// failure is logged and the rest of the teardown continues.
pub async fn teardown(registry: &TunnelRegistry, host_filter: &dyn HostFilter) {
    for entry in registry.entries() {
        entry.provider.disconnect().await;
        registry.set_state(&entry.id, TunnelState::Down, None);
    }
    if let Err(err) = host_filter.unblock_all_processes() {
        warn!(%err, "teardown: failed to unblock processes");
    }
    if let Err(err) = host_filter.teardown() {
        warn!(%err, "teardown: failed to remove host filter rules");
    }
}
