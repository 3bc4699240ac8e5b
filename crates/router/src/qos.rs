use splittun_net::packet::{TCP_FIN, TCP_RST, TCP_SYN, TOS_AF41, TOS_EF};
use splittun_net::{PacketMeta, Proto};
use splittun_rules::Priority;

const SMALL_UDP_PAYLOAD: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressClass {
    High,
    Normal,
    Low,
}

/// Per-packet heuristics for `Auto` priority: DNS, small high-port UDP
/// (voice/game traffic), TCP control segments.
pub fn packet_class(meta: &PacketMeta) -> EgressClass {
    match meta.proto {
        Proto::Udp => {
            if meta.src_port == 53 || meta.dst_port == 53 {
                return EgressClass::High;
            }
            if meta.payload_len < SMALL_UDP_PAYLOAD
                && meta.src_port >= 1024
                && meta.dst_port >= 1024
            {
                return EgressClass::High;
            }
            EgressClass::Normal
        }
        Proto::Tcp => {
            if meta.tcp_flags & (TCP_SYN | TCP_FIN | TCP_RST) != 0 {
                EgressClass::High
            } else {
                EgressClass::Normal
            }
        }
        Proto::Icmp => EgressClass::Normal,
    }
}

/// Map the rule-level priority to an egress class, with the per-packet
/// control boost applied to Normal flows.
pub fn egress_class(rule: Priority, meta: &PacketMeta) -> EgressClass {
    match rule {
        Priority::Realtime => EgressClass::High,
        Priority::Low => EgressClass::Low,
        Priority::Normal => {
            if meta.proto == Proto::Tcp && meta.tcp_flags & (TCP_SYN | TCP_FIN | TCP_RST) != 0 {
                EgressClass::High
            } else {
                EgressClass::Normal
            }
        }
        Priority::Auto => packet_class(meta),
    }
}

/// DSCP value for high-priority packets: EF for small UDP, AF41 otherwise.
pub fn tos_for(meta: &PacketMeta, class: EgressClass) -> Option<u8> {
    if class != EgressClass::High {
        return None;
    }
    if meta.proto == Proto::Udp && meta.payload_len < SMALL_UDP_PAYLOAD {
        Some(TOS_EF)
    } else {
        Some(TOS_AF41)
    }
}
