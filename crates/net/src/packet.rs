//! In-place edits to raw IPv4 frames.
//!
//! The parser returns a fixed-shape [`PacketMeta`] instead of sub-slices so
//! the same buffer flows through parse, edit and write. Every edit keeps the
//! IP header checksum and the transport checksum valid via incremental
//! updates; none of them allocate.

use std::net::Ipv4Addr;

use smoltcp::wire::{Icmpv4Message, Icmpv4Packet, IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};

use crate::checksum::{update16, update32};

pub const IPV4_HEADER_MIN: usize = 20;
pub const TCP_HEADER_MIN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ICMP_HEADER_LEN: usize = 8;
pub const MAX_PACKET: usize = 65535;
pub const TUNNEL_MTU: usize = 1400;
pub const MSS_LIMIT: u16 = 1360;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

/// Full ToS byte for Expedited Forwarding (DSCP 46).
pub const TOS_EF: u8 = 0xb8;
/// Full ToS byte for Assured Forwarding 41 (DSCP 34).
pub const TOS_AF41: u8 = 0x88;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
    Icmp,
}

impl Proto {
    pub fn number(self) -> u8 {
        match self {
            Proto::Tcp => 6,
            Proto::Udp => 17,
            Proto::Icmp => 1,
        }
    }
}

/// Fixed-shape metadata extracted from a raw IPv4 frame.
///
/// For ICMP Echo the identifier doubles as both ports (the flow pseudo-port).
#[derive(Clone, Copy, Debug)]
pub struct PacketMeta {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: Proto,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport_offset: usize,
    pub total_len: usize,
    pub tcp_flags: u8,
    pub payload_len: usize,
}

/// Parse and validate a raw IPv4 frame.
///
/// Returns `None` for anything the router ignores: truncated or non-v4
/// frames, non-initial fragments, protocols other than TCP/UDP/ICMP-Echo.
pub fn parse(buf: &[u8]) -> Option<PacketMeta> {
    if buf.len() < IPV4_HEADER_MIN || buf[0] >> 4 != 4 {
        return None;
    }
    let ipv4 = Ipv4Packet::new_checked(buf).ok()?;
    if ipv4.frag_offset() != 0 || ipv4.more_frags() {
        return None;
    }
    let transport_offset = usize::from(ipv4.header_len());
    let total_len = usize::from(ipv4.total_len());
    let src = ipv4.src_addr();
    let dst = ipv4.dst_addr();

    match ipv4.next_header() {
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(ipv4.payload()).ok()?;
            let mut flags = 0u8;
            if tcp.fin() {
                flags |= TCP_FIN;
            }
            if tcp.syn() {
                flags |= TCP_SYN;
            }
            if tcp.rst() {
                flags |= TCP_RST;
            }
            if tcp.psh() {
                flags |= TCP_PSH;
            }
            if tcp.ack() {
                flags |= TCP_ACK;
            }
            let header_len = usize::from(tcp.header_len());
            Some(PacketMeta {
                src,
                dst,
                proto: Proto::Tcp,
                src_port: tcp.src_port(),
                dst_port: tcp.dst_port(),
                transport_offset,
                total_len,
                tcp_flags: flags,
                payload_len: total_len - transport_offset - header_len,
            })
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(ipv4.payload()).ok()?;
            Some(PacketMeta {
                src,
                dst,
                proto: Proto::Udp,
                src_port: udp.src_port(),
                dst_port: udp.dst_port(),
                transport_offset,
                total_len,
                tcp_flags: 0,
                payload_len: total_len - transport_offset - UDP_HEADER_LEN,
            })
        }
        IpProtocol::Icmp => {
            let icmp = Icmpv4Packet::new_checked(ipv4.payload()).ok()?;
            match icmp.msg_type() {
                Icmpv4Message::EchoRequest | Icmpv4Message::EchoReply => {}
                _ => return None,
            }
            let ident = icmp.echo_ident();
            Some(PacketMeta {
                src,
                dst,
                proto: Proto::Icmp,
                src_port: ident,
                dst_port: ident,
                transport_offset,
                total_len,
                tcp_flags: 0,
                payload_len: total_len - transport_offset - ICMP_HEADER_LEN,
            })
        }
        _ => None,
    }
}

/// Swap src and dst addresses. The one's-complement sum is commutative, so
/// neither the IP nor the transport checksum changes.
pub fn swap_ips(buf: &mut [u8], meta: &mut PacketMeta) {
    let src: [u8; 4] = buf[12..16].try_into().unwrap();
    let dst: [u8; 4] = buf[16..20].try_into().unwrap();
    buf[12..16].copy_from_slice(&dst);
    buf[16..20].copy_from_slice(&src);
    std::mem::swap(&mut meta.src, &mut meta.dst);
}

pub fn set_src_ip(buf: &mut [u8], meta: &mut PacketMeta, new: Ipv4Addr) {
    let old = u32::from(meta.src);
    rewrite_ip(buf, meta, 12, old, u32::from(new));
    meta.src = new;
}

pub fn set_dst_ip(buf: &mut [u8], meta: &mut PacketMeta, new: Ipv4Addr) {
    let old = u32::from(meta.dst);
    rewrite_ip(buf, meta, 16, old, u32::from(new));
    meta.dst = new;
}

fn rewrite_ip(buf: &mut [u8], meta: &PacketMeta, offset: usize, old: u32, new: u32) {
    if old == new {
        return;
    }
    buf[offset..offset + 4].copy_from_slice(&new.to_be_bytes());
    let ip_sum = read16(buf, 10);
    write16(buf, 10, update32(ip_sum, old, new));
    // Transport checksums cover the pseudo-header.
    if let Some(sum_off) = transport_checksum_offset(buf, meta) {
        let sum = read16(buf, sum_off);
        write16(buf, sum_off, update32(sum, old, new));
    }
}

pub fn set_src_port(buf: &mut [u8], meta: &mut PacketMeta, new: u16) {
    let old = meta.src_port;
    rewrite_port(buf, meta, meta.transport_offset, old, new);
    meta.src_port = new;
    if meta.proto == Proto::Icmp {
        meta.dst_port = new;
    }
}

pub fn set_dst_port(buf: &mut [u8], meta: &mut PacketMeta, new: u16) {
    let old = meta.dst_port;
    let offset = match meta.proto {
        // The echo identifier is a single field.
        Proto::Icmp => meta.transport_offset,
        _ => meta.transport_offset + 2,
    };
    rewrite_port(buf, meta, offset, old, new);
    meta.dst_port = new;
    if meta.proto == Proto::Icmp {
        meta.src_port = new;
    }
}

fn rewrite_port(buf: &mut [u8], meta: &PacketMeta, mut offset: usize, old: u16, new: u16) {
    if old == new {
        return;
    }
    if meta.proto == Proto::Icmp {
        offset = meta.transport_offset + 4;
    }
    buf[offset..offset + 2].copy_from_slice(&new.to_be_bytes());
    let sum_off = match meta.proto {
        Proto::Icmp => Some(meta.transport_offset + 2),
        _ => transport_checksum_offset(buf, meta),
    };
    if let Some(sum_off) = sum_off {
        let sum = read16(buf, sum_off);
        write16(buf, sum_off, update16(sum, old, new));
    }
}

/// Clamp the TCP MSS option on a SYN segment. Returns true if changed.
pub fn clamp_mss(buf: &mut [u8], meta: &PacketMeta) -> bool {
    if meta.proto != Proto::Tcp || meta.tcp_flags & TCP_SYN == 0 {
        return false;
    }
    let t = meta.transport_offset;
    let header_len = usize::from(buf[t + 12] >> 4) * 4;
    let end = (t + header_len).min(buf.len());
    let mut off = t + TCP_HEADER_MIN;
    while off < end {
        match buf[off] {
            0 => break,
            1 => off += 1,
            2 => {
                if off + 4 > end || buf[off + 1] != 4 {
                    break;
                }
                let mss = u16::from_be_bytes([buf[off + 2], buf[off + 3]]);
                if mss <= MSS_LIMIT {
                    return false;
                }
                buf[off + 2..off + 4].copy_from_slice(&MSS_LIMIT.to_be_bytes());
                let sum_off = t + 16;
                let sum = read16(buf, sum_off);
                write16(buf, sum_off, update16(sum, mss, MSS_LIMIT));
                return true;
            }
            _ => {
                if off + 1 >= end {
                    break;
                }
                let len = usize::from(buf[off + 1]);
                if len < 2 {
                    break;
                }
                off += len;
            }
        }
    }
    false
}

/// Set the DSCP codepoint (full ToS value, ECN bits preserved).
///
/// The old ToS word is read before the new one is written: an incremental
/// update computed from the already-written value would be a corrupting no-op.
pub fn mark_dscp(buf: &mut [u8], tos: u8) -> bool {
    let old_word = read16(buf, 0);
    let old_tos = buf[1];
    let new_tos = (tos & 0xfc) | (old_tos & 0x03);
    if new_tos == old_tos {
        return false;
    }
    buf[1] = new_tos;
    let new_word = read16(buf, 0);
    let sum = read16(buf, 10);
    write16(buf, 10, update16(sum, old_word, new_word));
    true
}

fn transport_checksum_offset(buf: &[u8], meta: &PacketMeta) -> Option<usize> {
    match meta.proto {
        Proto::Tcp => Some(meta.transport_offset + 16),
        Proto::Udp => {
            let off = meta.transport_offset + 6;
            // UDP checksum 0 means disabled; leave it alone.
            (read16(buf, off) != 0).then_some(off)
        }
        // The ICMP checksum does not cover the IP pseudo-header.
        Proto::Icmp => None,
    }
}

fn read16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn write16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}
