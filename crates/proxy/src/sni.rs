//! SNI extraction from a TLS ClientHello.

/// Walk record -> handshake -> extensions -> server_name. Returns the
/// lowercased hostname, or None if the bytes are not a complete ClientHello
/// carrying one.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    // TLS record header: type 0x16 (handshake), version, length.
    if data.len() < 5 || data[0] != 0x16 {
        return None;
    }
    let record_len = usize::from(u16::from_be_bytes([data[3], data[4]]));
    let handshake = data.get(5..5 + record_len)?;

    // Handshake header: type 0x01 (ClientHello), 24-bit length.
    if handshake.len() < 4 || handshake[0] != 0x01 {
        return None;
    }
    let hs_len = (usize::from(handshake[1]) << 16)
        | (usize::from(handshake[2]) << 8)
        | usize::from(handshake[3]);
    let body = handshake.get(4..4 + hs_len)?;

    // client_version(2) random(32) session_id cipher_suites compression.
    let mut off = 34;
    let sid_len = usize::from(*body.get(off)?);
    off += 1 + sid_len;
    let cs_len = usize::from(u16::from_be_bytes([*body.get(off)?, *body.get(off + 1)?]));
    off += 2 + cs_len;
    let comp_len = usize::from(*body.get(off)?);
    off += 1 + comp_len;

    let ext_total = usize::from(u16::from_be_bytes([*body.get(off)?, *body.get(off + 1)?]));
    off += 2;
    let mut ext = body.get(off..off + ext_total)?;
    while ext.len() >= 4 {
        let ext_type = u16::from_be_bytes([ext[0], ext[1]]);
        let ext_len = usize::from(u16::from_be_bytes([ext[2], ext[3]]));
        let ext_data = ext.get(4..4 + ext_len)?;
        if ext_type == 0 {
            return parse_server_name(ext_data);
        }
        ext = &ext[4 + ext_len..];
    }
    None
}

fn parse_server_name(data: &[u8]) -> Option<String> {
    let list_len = usize::from(u16::from_be_bytes([*data.first()?, *data.get(1)?]));
    let mut names = data.get(2..2 + list_len)?;
    while names.len() >= 3 {
        let name_type = names[0];
        let name_len = usize::from(u16::from_be_bytes([names[1], names[2]]));
        let name = names.get(3..3 + name_len)?;
        if name_type == 0 {
            return std::str::from_utf8(name).ok().map(str::to_lowercase);
        }
        names = &names[3 + name_len..];
    }
    None
}

/// A peek can stop early when the stream is clearly not TLS.
pub(crate) fn looks_like_tls(data: &[u8]) -> bool {
    data.is_empty() || data[0] == 0x16
}
