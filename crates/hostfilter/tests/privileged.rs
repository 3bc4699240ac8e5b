#![cfg(feature = "privileged-tests")]

use splittun_hostfilter::{HostFilter, NftFilter};
use splittun_util::CommandRunner;

fn allow_hostfilter_tests() -> bool {
    std::env::var("SPLITTUN_PRIV_TESTS_ALLOW_HOSTFILTER").ok().as_deref() == Some("1")
}

#[test]
#[ignore]
fn apply_and_teardown_filter_table() {
    if !allow_hostfilter_tests() {
        eprintln!("skipping host filter test (set SPLITTUN_PRIV_TESTS_ALLOW_HOSTFILTER=1)");
        return;
    }

    let runner = CommandRunner::new(true, false);
    let filter = NftFilter::new("splittun_test".to_string(), "lo".to_string(), 0x2, runner)
        .expect("apply empty filter state");

    filter.block_all_ipv6().unwrap();
    filter.permit_dns_for_self("lo").unwrap();
    filter
        .add_bypass_prefixes(&["192.0.2.0/24".to_string()])
        .unwrap();
    filter
        .permit_direct_ip(std::net::Ipv4Addr::new(93, 184, 216, 34))
        .unwrap();
    filter
        .remove_direct_ip(std::net::Ipv4Addr::new(93, 184, 216, 34))
        .unwrap();
    filter.ensure_blocked("/usr/bin/true").unwrap();
    filter.unblock_all_processes().unwrap();
    filter.teardown().unwrap();
}
