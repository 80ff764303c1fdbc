use std::{collections::BTreeMap, net::{SocketAddr, SocketAddrV4}};
use bencode::Value;

/// The id we advertise in our own extended handshake `m` dict for
/// `ut_pex`; peers address their PEX messages to us using this id.
pub const UT_PEX_ID: u8 = 1;

/// Builds the BEP 10 extended handshake payload sent once, right after a
/// peer's regular handshake indicates it supports extensions.
pub fn build_handshake() -> Vec<u8> {
    let mut m = BTreeMap::new();
    m.insert(b"ut_pex".to_vec(), Value::Int(UT_PEX_ID as i64));

    let mut dict = BTreeMap::new();
    dict.insert(b"m".to_vec(), Value::Dict(m));
    dict.insert(b"v".to_vec(), Value::Bytes(b"bittorrent-rs".to_vec()));

    bencode::encode_to_raw(&Value::Dict(dict)).unwrap_or_default()
}

/// Reads the id a peer wants `ut_pex` messages addressed to, out of its
/// extended handshake payload. `None` if the peer didn't advertise it.
pub fn parse_handshake(payload: &[u8]) -> Option<u8> {
    let value: Value = bencode::decode_bytes(payload).ok()?;
    let id = value.get(b"m").and_then(|m| m.get(b"ut_pex"))?.as_int()?;
    u8::try_from(id).ok()
}

/// Packs addresses the BEP 11 way: 6 bytes each, a big-endian IPv4 address
/// followed by a big-endian port. IPv6 peers are silently dropped; this
/// exchange doesn't implement the `ut_pex` IPv6 companion field.
fn pack_peers<'a>(peers: impl Iterator<Item = &'a SocketAddr>) -> Vec<u8> {
    let mut buf = Vec::new();
    for addr in peers {
        if let SocketAddr::V4(addr) = addr {
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    buf
}

/// Builds a `ut_pex` message body listing the peers added/dropped since
/// the last exchange with this particular peer.
pub fn build_pex<'a>(
    added: impl Iterator<Item = &'a SocketAddr>,
    dropped: impl Iterator<Item = &'a SocketAddr>,
) -> Vec<u8> {
    let mut dict = BTreeMap::new();
    dict.insert(b"added".to_vec(), Value::Bytes(pack_peers(added)));
    dict.insert(b"dropped".to_vec(), Value::Bytes(pack_peers(dropped)));
    bencode::encode_to_raw(&Value::Dict(dict)).unwrap_or_default()
}

/// Parses a `ut_pex` message body into the peers it lists as newly added.
/// Dropped peers aren't acted on: we don't evict live candidates just
/// because one peer's view of the swarm moved on.
pub fn parse_added(payload: &[u8]) -> Vec<SocketAddr> {
    let Ok(value) = bencode::decode_bytes::<Value>(payload) else {
        return Vec::new();
    };
    let Some(added) = value.get(b"added").and_then(Value::as_bytes) else {
        return Vec::new();
    };
    added
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips_ut_pex_id() {
        let payload = build_handshake();
        assert_eq!(parse_handshake(&payload), Some(UT_PEX_ID));
    }

    #[test]
    fn parse_handshake_ignores_missing_m_dict() {
        let payload = bencode::encode_to_raw(&Value::Dict(BTreeMap::new())).unwrap();
        assert_eq!(parse_handshake(&payload), None);
    }

    #[test]
    fn pex_round_trips_added_peers() {
        let a: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.5:51413".parse().unwrap();
        let payload = build_pex([&a, &b].into_iter(), std::iter::empty());
        let parsed = parse_added(&payload);
        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn pex_skips_ipv6_peers() {
        let v6: SocketAddr = "[::1]:6881".parse().unwrap();
        let payload = build_pex(std::iter::once(&v6), std::iter::empty());
        assert!(parse_added(&payload).is_empty());
    }
}
