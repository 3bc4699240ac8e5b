//! Minimal DNS wire-format helpers.
//!
//! Cache entries hold raw response bytes; serving a hit means rewriting the
//! transaction id and decrementing TTLs in place, so everything here works
//! directly on the message buffer.

use std::net::Ipv4Addr;

pub const HEADER_LEN: usize = 12;
pub const MAX_UDP_PAYLOAD: usize = 4096;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_OPT: u16 = 41;
pub const QCLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

const MAX_NAME_LEN: usize = 255;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("malformed name")]
    BadName,
    #[error("unsupported question count {0}")]
    BadQdCount(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Question {
    pub id: u16,
    /// Lowercased, no trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Offset of the first resource record.
    pub rr_offset: usize,
}

pub fn txid(msg: &[u8]) -> Option<u16> {
    (msg.len() >= 2).then(|| u16::from_be_bytes([msg[0], msg[1]]))
}

pub fn set_txid(msg: &mut [u8], id: u16) {
    if msg.len() >= 2 {
        msg[0..2].copy_from_slice(&id.to_be_bytes());
    }
}

pub fn rcode(msg: &[u8]) -> u8 {
    if msg.len() < 4 {
        return RCODE_SERVFAIL;
    }
    msg[3] & 0x0f
}

pub fn is_truncated(msg: &[u8]) -> bool {
    msg.len() >= 4 && (u16::from_be_bytes([msg[2], msg[3]]) & FLAG_TC) != 0
}

pub fn qdcount(msg: &[u8]) -> u16 {
    count(msg, 4)
}

pub fn ancount(msg: &[u8]) -> u16 {
    count(msg, 6)
}

fn count(msg: &[u8], offset: usize) -> u16 {
    if msg.len() < offset + 2 {
        return 0;
    }
    u16::from_be_bytes([msg[offset], msg[offset + 1]])
}

/// Parse the single question of a query or response.
pub fn parse_question(msg: &[u8]) -> Result<Question, WireError> {
    if msg.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let qd = qdcount(msg);
    if qd != 1 {
        return Err(WireError::BadQdCount(qd));
    }
    let (name, offset) = read_name(msg, HEADER_LEN)?;
    if offset + 4 > msg.len() {
        return Err(WireError::Truncated);
    }
    Ok(Question {
        id: u16::from_be_bytes([msg[0], msg[1]]),
        name,
        qtype: u16::from_be_bytes([msg[offset], msg[offset + 1]]),
        qclass: u16::from_be_bytes([msg[offset + 2], msg[offset + 3]]),
        rr_offset: offset + 4,
    })
}

fn read_name(msg: &[u8], mut offset: usize) -> Result<(String, usize), WireError> {
    let mut name = String::new();
    loop {
        let len = *msg.get(offset).ok_or(WireError::Truncated)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        // Compression pointers are not expected in the question section.
        if len & 0xc0 != 0 {
            return Err(WireError::BadName);
        }
        offset += 1;
        let label = msg.get(offset..offset + len).ok_or(WireError::Truncated)?;
        if !name.is_empty() {
            name.push('.');
        }
        for b in label {
            name.push(b.to_ascii_lowercase() as char);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(WireError::BadName);
        }
        offset += len;
    }
    Ok((name, offset))
}

/// Skip a possibly-compressed name inside a resource record.
fn skip_name(msg: &[u8], mut offset: usize) -> Result<usize, WireError> {
    loop {
        let len = *msg.get(offset).ok_or(WireError::Truncated)? as usize;
        if len == 0 {
            return Ok(offset + 1);
        }
        if len & 0xc0 == 0xc0 {
            if offset + 2 > msg.len() {
                return Err(WireError::Truncated);
            }
            return Ok(offset + 2);
        }
        if len & 0xc0 != 0 {
            return Err(WireError::BadName);
        }
        offset += 1 + len;
    }
}

fn walk_rrs(
    msg: &[u8],
    rr_offset: usize,
    mut visit: impl FnMut(&[u8], RrView),
) -> Result<(), WireError> {
    let total =
        usize::from(count(msg, 6)) + usize::from(count(msg, 8)) + usize::from(count(msg, 10));
    let mut offset = rr_offset;
    for _ in 0..total {
        let fixed = skip_name(msg, offset)?;
        if fixed + 10 > msg.len() {
            return Err(WireError::Truncated);
        }
        let rtype = u16::from_be_bytes([msg[fixed], msg[fixed + 1]]);
        let rdlength = usize::from(u16::from_be_bytes([msg[fixed + 8], msg[fixed + 9]]));
        let rdata_offset = fixed + 10;
        if rdata_offset + rdlength > msg.len() {
            return Err(WireError::Truncated);
        }
        visit(
            msg,
            RrView {
                rtype,
                ttl_offset: fixed + 4,
                rdata_offset,
                rdlength,
            },
        );
        offset = rdata_offset + rdlength;
    }
    Ok(())
}

struct RrView {
    rtype: u16,
    ttl_offset: usize,
    rdata_offset: usize,
    rdlength: usize,
}

/// Minimum TTL across answer/authority/additional, skipping OPT
/// pseudo-records (their TTL field carries EDNS flags).
pub fn min_ttl(msg: &[u8], rr_offset: usize) -> Option<u32> {
    let mut min = None;
    walk_rrs(msg, rr_offset, |msg, rr| {
        if rr.rtype == QTYPE_OPT {
            return;
        }
        let ttl = u32::from_be_bytes([
            msg[rr.ttl_offset],
            msg[rr.ttl_offset + 1],
            msg[rr.ttl_offset + 2],
            msg[rr.ttl_offset + 3],
        ]);
        min = Some(min.map_or(ttl, |m: u32| m.min(ttl)));
    })
    .ok()?;
    min
}

/// Decrement every RR TTL in place by `elapsed`, flooring at 1.
pub fn decrement_ttls(msg: &mut [u8], rr_offset: usize, elapsed: u32) {
    let mut edits = Vec::new();
    let _ = walk_rrs(msg, rr_offset, |msg, rr| {
        if rr.rtype == QTYPE_OPT {
            return;
        }
        let ttl = u32::from_be_bytes([
            msg[rr.ttl_offset],
            msg[rr.ttl_offset + 1],
            msg[rr.ttl_offset + 2],
            msg[rr.ttl_offset + 3],
        ]);
        edits.push((rr.ttl_offset, ttl.saturating_sub(elapsed).max(1)));
    });
    for (offset, ttl) in edits {
        msg[offset..offset + 4].copy_from_slice(&ttl.to_be_bytes());
    }
}

/// Answer-section A records as (address, ttl).
pub fn a_records(msg: &[u8], rr_offset: usize) -> Vec<(Ipv4Addr, u32)> {
    let answers = usize::from(ancount(msg));
    let mut records = Vec::new();
    let mut seen = 0usize;
    let _ = walk_rrs(msg, rr_offset, |msg, rr| {
        seen += 1;
        if seen > answers || rr.rtype != QTYPE_A || rr.rdlength != 4 {
            return;
        }
        let ttl = u32::from_be_bytes([
            msg[rr.ttl_offset],
            msg[rr.ttl_offset + 1],
            msg[rr.ttl_offset + 2],
            msg[rr.ttl_offset + 3],
        ]);
        let ip = Ipv4Addr::new(
            msg[rr.rdata_offset],
            msg[rr.rdata_offset + 1],
            msg[rr.rdata_offset + 2],
            msg[rr.rdata_offset + 3],
        );
        records.push((ip, ttl));
    });
    records
}

/// Synthesize a response echoing the query's question with zero records.
pub fn empty_response(query: &[u8], rcode: u8) -> Option<Vec<u8>> {
    let question = parse_question(query).ok()?;
    let mut out = query[..question.rr_offset].to_vec();
    let rd = u16::from_be_bytes([out[2], out[3]]) & FLAG_RD;
    let flags = FLAG_QR | FLAG_RA | rd | u16::from(rcode & 0x0f);
    out[2..4].copy_from_slice(&flags.to_be_bytes());
    out[6..8].copy_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    out[8..10].copy_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out[10..12].copy_from_slice(&0u16.to_be_bytes()); // ARCOUNT
    Some(out)
}

/// Synthesize an A response for the query (used by FakeIP).
pub fn a_response(query: &[u8], addrs: &[Ipv4Addr], ttl: u32) -> Option<Vec<u8>> {
    let mut out = empty_response(query, RCODE_NOERROR)?;
    out[6..8].copy_from_slice(&(addrs.len() as u16).to_be_bytes());
    for addr in addrs {
        out.extend_from_slice(&[0xc0, 0x0c]); // pointer to the question name
        out.extend_from_slice(&QTYPE_A.to_be_bytes());
        out.extend_from_slice(&QCLASS_IN.to_be_bytes());
        out.extend_from_slice(&ttl.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&addr.octets());
    }
    Some(out)
}
