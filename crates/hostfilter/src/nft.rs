use std::ffi::CString;
use std::net::Ipv4Addr;

use anyhow::{Context, Result, anyhow};
use nix::libc;
use nftnl::{
    Batch, Chain, FinalizedBatch, Hook, MsgType, Policy, ProtoFamily, Rule, Table, nft_expr,
};

use splittun_util::CommandRunner;

use crate::FilterState;

pub(crate) fn find_nft_binary() -> bool {
    splittun_util::find_in_path("nft").is_some()
}

/// Rebuild the whole table from the desired state in one libnftnl batch.
/// Works with CAP_NET_ADMIN; no nft binary required.
pub(crate) fn apply_native(
    table: &str,
    chain: &str,
    tun_name: &str,
    bypass_mark: u32,
    state: &FilterState,
) -> Result<()> {
    let table_c = CString::new(table).context("invalid nft table name")?;
    let chain_c = CString::new(chain).context("invalid nft chain name")?;
    let table = Table::new(table_c.as_c_str(), ProtoFamily::Inet);
    let mut chain = Chain::new(chain_c.as_c_str(), &table);
    chain.set_hook(Hook::Out, 0);
    chain.set_policy(Policy::Accept);

    let _ = delete_table(table_c.to_str().unwrap_or_default());

    let mut batch = Batch::new();
    batch.add(&table, MsgType::Add);
    batch.add(&chain, MsgType::Add);

    let lo_idx = iface_index("lo")?;
    let tun_idx = iface_index(tun_name)?;
    add_rule_accept_oif(&mut batch, &chain, lo_idx);
    add_rule_accept_oif(&mut batch, &chain, tun_idx);
    if state.self_permitted {
        add_rule_accept_mark(&mut batch, &chain, bypass_mark);
    }
    for (net, len) in &state.bypass_prefixes {
        add_rule_accept_prefix(&mut batch, &chain, *net, *len);
    }
    for ip in &state.direct_ips {
        add_rule_accept_daddr(&mut batch, &chain, *ip);
    }
    for interface in &state.dns_blocked_ifs {
        let idx = iface_index(interface)?;
        add_rule_dns_drop_udp(&mut batch, &chain, idx);
        add_rule_dns_drop_tcp(&mut batch, &chain, idx);
    }
    if state.block_ipv6 {
        add_rule_ipv6_drop(&mut batch, &chain, lo_idx);
    }
    if !state.blocked_exes.is_empty() {
        add_rule_unmarked_drop(&mut batch, &chain, tun_idx, lo_idx, bypass_mark);
    }

    let finalized = batch.finalize();
    send_and_process(&finalized)?;
    Ok(())
}

pub(crate) fn delete_table(table: &str) -> Result<()> {
    let table_c = CString::new(table).context("invalid nft table name")?;
    let table_obj = Table::new(table_c.as_c_str(), ProtoFamily::Inet);
    let mut batch = Batch::new();
    batch.add(&table_obj, MsgType::Del);
    let finalized = batch.finalize();
    match send_and_process(&finalized) {
        Ok(()) => Ok(()),
        // ENOENT - table doesn't exist
        Err(e) if e.raw_os_error() == Some(2) => Ok(()),
        Err(e) => Err(anyhow!("failed to delete nft table {table}: {e}")),
    }
}

fn iface_index(name: &str) -> Result<u32> {
    let cstr = CString::new(name).context("invalid interface name")?;
    let idx = unsafe { libc::if_nametoindex(cstr.as_ptr()) };
    if idx == 0 {
        return Err(anyhow!("interface not found: {name}"));
    }
    Ok(idx)
}

fn add_rule_accept_oif(batch: &mut Batch, chain: &Chain, index: u32) {
    let mut rule = Rule::new(chain);
    rule.add_expr(&nft_expr!(meta oif));
    rule.add_expr(&nft_expr!(cmp == index));
    rule.add_expr(&nft_expr!(verdict accept));
    batch.add(&rule, MsgType::Add);
}

fn add_rule_accept_mark(batch: &mut Batch, chain: &Chain, mark: u32) {
    let mut rule = Rule::new(chain);
    rule.add_expr(&nft_expr!(meta mark));
    rule.add_expr(&nft_expr!(cmp == mark));
    rule.add_expr(&nft_expr!(verdict accept));
    batch.add(&rule, MsgType::Add);
}

fn add_rule_accept_daddr(batch: &mut Batch, chain: &Chain, ip: Ipv4Addr) {
    let mut rule = Rule::new(chain);
    rule.add_expr(&nft_expr!(meta nfproto));
    rule.add_expr(&nft_expr!(cmp == libc::NFPROTO_IPV4 as u8));
    rule.add_expr(&nft_expr!(payload ipv4 daddr));
    rule.add_expr(&nft_expr!(cmp == ip));
    rule.add_expr(&nft_expr!(verdict accept));
    batch.add(&rule, MsgType::Add);
}

fn add_rule_accept_prefix(batch: &mut Batch, chain: &Chain, net: Ipv4Addr, len: u8) {
    if len >= 32 {
        add_rule_accept_daddr(batch, chain, net);
        return;
    }
    let mask = Ipv4Addr::from(if len == 0 { 0 } else { u32::MAX << (32 - len) });
    let mut rule = Rule::new(chain);
    rule.add_expr(&nft_expr!(meta nfproto));
    rule.add_expr(&nft_expr!(cmp == libc::NFPROTO_IPV4 as u8));
    rule.add_expr(&nft_expr!(payload ipv4 daddr));
    rule.add_expr(&nft_expr!(bitwise mask mask, xor 0u32));
    rule.add_expr(&nft_expr!(cmp == net));
    rule.add_expr(&nft_expr!(verdict accept));
    batch.add(&rule, MsgType::Add);
}

fn add_rule_dns_drop_udp(batch: &mut Batch, chain: &Chain, oif_index: u32) {
    let port = 53u16.to_be();
    let mut rule = Rule::new(chain);
    rule.add_expr(&nft_expr!(meta oif));
    rule.add_expr(&nft_expr!(cmp == oif_index));
    rule.add_expr(&nft_expr!(meta l4proto));
    rule.add_expr(&nft_expr!(cmp == libc::IPPROTO_UDP as u8));
    rule.add_expr(&nft_expr!(payload udp dport));
    rule.add_expr(&nft_expr!(cmp == port));
    rule.add_expr(&nft_expr!(verdict drop));
    batch.add(&rule, MsgType::Add);
}

fn add_rule_dns_drop_tcp(batch: &mut Batch, chain: &Chain, oif_index: u32) {
    let port = 53u16.to_be();
    let mut rule = Rule::new(chain);
    rule.add_expr(&nft_expr!(meta oif));
    rule.add_expr(&nft_expr!(cmp == oif_index));
    rule.add_expr(&nft_expr!(meta l4proto));
    rule.add_expr(&nft_expr!(cmp == libc::IPPROTO_TCP as u8));
    rule.add_expr(&nft_expr!(payload tcp dport));
    rule.add_expr(&nft_expr!(cmp == port));
    rule.add_expr(&nft_expr!(verdict drop));
    batch.add(&rule, MsgType::Add);
}

fn add_rule_ipv6_drop(batch: &mut Batch, chain: &Chain, lo_index: u32) {
    let mut rule = Rule::new(chain);
    rule.add_expr(&nft_expr!(meta nfproto));
    rule.add_expr(&nft_expr!(cmp == libc::NFPROTO_IPV6 as u8));
    rule.add_expr(&nft_expr!(meta oif));
    rule.add_expr(&nft_expr!(cmp != lo_index));
    rule.add_expr(&nft_expr!(verdict drop));
    batch.add(&rule, MsgType::Add);
}

/// Everything leaving a physical interface without the bypass mark is
/// dropped once any executable is pinned off the NIC.
fn add_rule_unmarked_drop(
    batch: &mut Batch,
    chain: &Chain,
    tun_index: u32,
    lo_index: u32,
    mark: u32,
) {
    let mut rule = Rule::new(chain);
    rule.add_expr(&nft_expr!(meta oif));
    rule.add_expr(&nft_expr!(cmp != tun_index));
    rule.add_expr(&nft_expr!(meta oif));
    rule.add_expr(&nft_expr!(cmp != lo_index));
    rule.add_expr(&nft_expr!(meta mark));
    rule.add_expr(&nft_expr!(cmp != mark));
    rule.add_expr(&nft_expr!(verdict drop));
    batch.add(&rule, MsgType::Add);
}

fn send_and_process(batch: &FinalizedBatch) -> std::io::Result<()> {
    let socket = mnl::Socket::new(mnl::Bus::Netfilter)?;
    let portid = socket.portid();
    socket.send_all(batch)?;
    let mut buffer = vec![0; nftnl::nft_nlmsg_maxsize() as usize];
    let mut expected_seqs = batch.sequence_numbers();
    while !expected_seqs.is_empty() {
        let len = socket.recv(&mut buffer[..])?;
        let expected_seq = expected_seqs.next().expect("unexpected nft ack");
        mnl::cb_run(&buffer[..len], expected_seq, portid)?;
    }
    Ok(())
}

/// The `nft` CLI rendition of the same desired state, for the fallback
/// path. First command is the allowed-to-fail table delete.
pub(crate) fn build_cmds(
    table: &str,
    chain: &str,
    tun_name: &str,
    bypass_mark: u32,
    state: &FilterState,
) -> Vec<Vec<String>> {
    let mut cmds = Vec::new();
    cmds.push(
        vec!["delete", "table", "inet", table]
            .into_iter()
            .map(String::from)
            .collect(),
    );
    cmds.push(
        vec!["add", "table", "inet", table]
            .into_iter()
            .map(String::from)
            .collect(),
    );
    cmds.push(
        vec![
            "add", "chain", "inet", table, chain, "{", "type", "filter", "hook", "output",
            "priority", "0", ";", "policy", "accept", ";", "}",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
    );

    let rule = |rest: &[String]| {
        let mut cmd = vec![
            "add".to_string(),
            "rule".to_string(),
            "inet".to_string(),
            table.to_string(),
            chain.to_string(),
        ];
        cmd.extend_from_slice(rest);
        cmd
    };
    cmds.push(rule(&["oifname".into(), "lo".into(), "accept".into()]));
    cmds.push(rule(&["oifname".into(), tun_name.into(), "accept".into()]));
    if state.self_permitted {
        cmds.push(rule(&[
            "meta".into(),
            "mark".into(),
            format!("0x{bypass_mark:x}"),
            "accept".into(),
        ]));
    }
    for (net, len) in &state.bypass_prefixes {
        cmds.push(rule(&[
            "ip".into(),
            "daddr".into(),
            format!("{net}/{len}"),
            "accept".into(),
        ]));
    }
    for ip in &state.direct_ips {
        cmds.push(rule(&["ip".into(), "daddr".into(), ip.to_string(), "accept".into()]));
    }
    for interface in &state.dns_blocked_ifs {
        cmds.push(rule(&[
            "oifname".into(),
            interface.into(),
            "udp".into(),
            "dport".into(),
            "53".into(),
            "drop".into(),
        ]));
        cmds.push(rule(&[
            "oifname".into(),
            interface.into(),
            "tcp".into(),
            "dport".into(),
            "53".into(),
            "drop".into(),
        ]));
    }
    if state.block_ipv6 {
        cmds.push(rule(&[
            "meta".into(),
            "nfproto".into(),
            "ipv6".into(),
            "oifname".into(),
            "!=".into(),
            "lo".into(),
            "drop".into(),
        ]));
    }
    if !state.blocked_exes.is_empty() {
        cmds.push(rule(&[
            "oifname".into(),
            "!=".into(),
            tun_name.into(),
            "oifname".into(),
            "!=".into(),
            "lo".into(),
            "meta".into(),
            "mark".into(),
            "!=".into(),
            format!("0x{bypass_mark:x}"),
            "drop".into(),
        ]));
    }
    cmds
}

pub(crate) fn apply_cmd(
    table: &str,
    chain: &str,
    tun_name: &str,
    bypass_mark: u32,
    state: &FilterState,
    runner: &CommandRunner,
) -> Result<()> {
    let cmds = build_cmds(table, chain, tun_name, bypass_mark, state);
    for (idx, cmd) in cmds.into_iter().enumerate() {
        let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
        if idx == 0 {
            let _ = runner.run_capture_allow_fail("nft", &args);
        } else {
            runner.run("nft", &args)?;
        }
    }
    Ok(())
}
