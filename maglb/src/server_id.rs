//! Server ids embedded in connection identifiers.
//!
//! A backend can advertise a small id inside the connection ids it hands out
//! (QUIC) or inside a TCP option it echoes. Packets that carry such an id are
//! routed straight to the backend owning it.

use ahash::AHashMap;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Longest TCP option list walked looking for the server id option.
pub const MAX_TCP_OPTIONS: usize = 20;
pub const TCP_SERVER_ID_OPTION: u8 = 0xB7;
const TCP_SERVER_ID_OPTION_LEN: u8 = 6;
const TCP_OPT_EOL: u8 = 0;
const TCP_OPT_NOP: u8 = 1;

/// Shortest QUIC destination connection id that can carry a server id.
pub const QUIC_MIN_CID_LEN: usize = 8;
const QUIC_LONG_HEADER: u8 = 0x80;
const QUIC_PACKET_TYPE_MASK: u8 = 0x30;
const QUIC_HANDSHAKE: u8 = 0x20;
const QUIC_RETRY: u8 = 0x30;
// flags(1) + version(4) + dcid len(1)
const QUIC_LONG_HEADER_LEN: usize = 6;
// short headers carry no length, the receiver knows it
const QUIC_SHORT_HEADER_LEN: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerIdMode {
    /// Array indexed by id.
    #[default]
    Direct,
    /// Bounded hash map, for sparse id spaces.
    Hashed,
}

/// Server id → backend id.
#[derive(Debug, Clone)]
pub enum ServerIdTable {
    Direct(Vec<Option<u32>>),
    Hashed { map: AHashMap<u32, u32>, max: u32 },
}

impl ServerIdTable {
    pub fn new(mode: ServerIdMode, max: u32) -> Self {
        match mode {
            ServerIdMode::Direct => ServerIdTable::Direct(vec![None; max as usize]),
            ServerIdMode::Hashed => ServerIdTable::Hashed {
                map: AHashMap::new(),
                max,
            },
        }
    }

    /// Backend id owning `server_id`. Id 0 never resolves.
    #[inline]
    pub fn resolve_embedded_id(&self, server_id: u32) -> Option<u32> {
        if server_id == 0 {
            return None;
        }
        match self {
            ServerIdTable::Direct(ids) => ids.get(server_id as usize).copied().flatten(),
            ServerIdTable::Hashed { map, .. } => map.get(&server_id).copied(),
        }
    }

    pub fn insert(&mut self, server_id: u32, real: u32) -> Result<()> {
        match self {
            ServerIdTable::Direct(ids) => {
                let max = ids.len() as u32;
                match ids.get_mut(server_id as usize) {
                    Some(slot) if server_id != 0 => {
                        *slot = Some(real);
                        Ok(())
                    }
                    _ => Err(Error::ServerIdOutOfRange { id: server_id, max }),
                }
            }
            ServerIdTable::Hashed { map, max } => {
                if server_id == 0 {
                    return Err(Error::ServerIdOutOfRange {
                        id: server_id,
                        max: *max,
                    });
                }
                if !map.contains_key(&server_id) && map.len() >= *max as usize {
                    return Err(Error::TableFull {
                        table: "server id",
                        max: *max,
                    });
                }
                map.insert(server_id, real);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, server_id: u32) -> Option<u32> {
        match self {
            ServerIdTable::Direct(ids) => ids.get_mut(server_id as usize)?.take(),
            ServerIdTable::Hashed { map, .. } => map.remove(&server_id),
        }
    }

    /// Drops every mapping pointing at `real`.
    pub fn remove_real(&mut self, real: u32) {
        match self {
            ServerIdTable::Direct(ids) => {
                for slot in ids.iter_mut().filter(|s| **s == Some(real)) {
                    *slot = None;
                }
            }
            ServerIdTable::Hashed { map, .. } => map.retain(|_, r| *r != real),
        }
    }
}

/// What the first bytes of a QUIC payload say about its server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicCid {
    /// Initial or 0-RTT long header; no server-chosen id yet.
    Initial,
    /// Id decoded from the destination connection id.
    ServerId { version: u8, id: u32 },
    /// Connection id version we cannot decode.
    UnknownVersion(u8),
    /// Too short to carry an id.
    Invalid,
}

/// Decodes the server id from a QUIC packet's destination connection id.
pub fn parse_quic_cid(payload: &[u8]) -> QuicCid {
    let first = match payload.first() {
        Some(b) => *b,
        None => return QuicCid::Invalid,
    };

    let cid = if first & QUIC_LONG_HEADER != 0 {
        let ty = first & QUIC_PACKET_TYPE_MASK;
        if ty != QUIC_HANDSHAKE && ty != QUIC_RETRY {
            return QuicCid::Initial;
        }
        let dcid_len = match payload.get(QUIC_LONG_HEADER_LEN - 1) {
            Some(l) => *l as usize,
            None => return QuicCid::Invalid,
        };
        if dcid_len < QUIC_MIN_CID_LEN {
            return QuicCid::Invalid;
        }
        payload.get(QUIC_LONG_HEADER_LEN..QUIC_LONG_HEADER_LEN + QUIC_MIN_CID_LEN)
    } else {
        payload.get(QUIC_SHORT_HEADER_LEN..QUIC_SHORT_HEADER_LEN + QUIC_MIN_CID_LEN)
    };

    match cid {
        Some(cid) => decode_cid(cid),
        None => QuicCid::Invalid,
    }
}

fn decode_cid(c: &[u8]) -> QuicCid {
    let version = c[0] >> 6;
    let id = match version {
        1 => ((c[0] as u32 & 0x3F) << 10) | ((c[1] as u32) << 2) | (c[2] as u32 >> 6),
        2 => (c[1] as u32) << 16 | (c[2] as u32) << 8 | c[3] as u32,
        3 => u32::from_be_bytes([c[1], c[2], c[3], c[4]]),
        v => return QuicCid::UnknownVersion(v),
    };
    QuicCid::ServerId { version, id }
}

/// Finds the server id option in a TCP options area.
pub fn parse_tcp_server_id(options: &[u8]) -> Option<u32> {
    let mut off = 0usize;
    for _ in 0..MAX_TCP_OPTIONS {
        let kind = *options.get(off)?;
        match kind {
            TCP_OPT_EOL => return None,
            TCP_OPT_NOP => off += 1,
            _ => {
                let len = *options.get(off + 1)?;
                if len < 2 {
                    return None;
                }
                if kind == TCP_SERVER_ID_OPTION && len == TCP_SERVER_ID_OPTION_LEN {
                    let v = options.get(off + 2..off + 6)?;
                    return Some(u32::from_be_bytes([v[0], v[1], v[2], v[3]]));
                }
                off += len as usize;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_table() {
        let mut t = ServerIdTable::new(ServerIdMode::Direct, 100);
        t.insert(42, 7).unwrap();
        assert_eq!(t.resolve_embedded_id(42), Some(7));
        assert_eq!(t.resolve_embedded_id(43), None);
        assert_eq!(t.resolve_embedded_id(1000), None);
        assert!(t.insert(100, 1).is_err());
        assert!(t.insert(0, 1).is_err());
        t.remove_real(7);
        assert_eq!(t.resolve_embedded_id(42), None);
    }

    #[test]
    fn hashed_table_is_bounded() {
        let mut t = ServerIdTable::new(ServerIdMode::Hashed, 1);
        t.insert(1_000_000, 3).unwrap();
        assert_eq!(t.resolve_embedded_id(1_000_000), Some(3));
        assert!(matches!(
            t.insert(5, 1),
            Err(Error::TableFull { max: 1, .. })
        ));
        assert_eq!(t.remove(1_000_000), Some(3));
        t.insert(5, 1).unwrap();
    }

    #[test]
    fn short_header_cid_versions() {
        // v1: 0b01 prefix, id spread over three bytes
        let mut pkt = [0u8; 12];
        pkt[0] = 0x40;
        pkt[1] = 0x40 | 0x01;
        pkt[2] = 0x02;
        pkt[3] = 0xC0;
        assert_eq!(
            parse_quic_cid(&pkt),
            QuicCid::ServerId { version: 1, id: (1 << 10) | (2 << 2) | 3 }
        );

        pkt[1] = 0x80;
        pkt[2] = 0x01;
        pkt[3] = 0x02;
        pkt[4] = 0x03;
        assert_eq!(
            parse_quic_cid(&pkt),
            QuicCid::ServerId { version: 2, id: 0x010203 }
        );

        pkt[1] = 0xC0;
        pkt[5] = 0x04;
        assert_eq!(
            parse_quic_cid(&pkt),
            QuicCid::ServerId { version: 3, id: 0x01020304 }
        );

        pkt[1] = 0x00;
        assert_eq!(parse_quic_cid(&pkt), QuicCid::UnknownVersion(0));
        assert_eq!(parse_quic_cid(&pkt[..5]), QuicCid::Invalid);
    }

    #[test]
    fn long_header_types() {
        let mut pkt = [0u8; 16];
        pkt[0] = 0xC0; // initial
        assert_eq!(parse_quic_cid(&pkt), QuicCid::Initial);
        pkt[0] = 0xD0; // 0-rtt
        assert_eq!(parse_quic_cid(&pkt), QuicCid::Initial);

        pkt[0] = 0xE0; // handshake
        pkt[5] = 8;
        pkt[6] = 0x80;
        pkt[8] = 0x12;
        assert_eq!(
            parse_quic_cid(&pkt),
            QuicCid::ServerId { version: 2, id: 0x1200 }
        );

        pkt[5] = 4;
        assert_eq!(parse_quic_cid(&pkt), QuicCid::Invalid);
    }

    #[test]
    fn tcp_option_walk() {
        let opts = [1, 1, 2, 4, 0x05, 0xb4, 0xB7, 6, 0, 0, 0x30, 0x39];
        assert_eq!(parse_tcp_server_id(&opts), Some(12345));

        // end of list before the option
        let opts = [1, 0, 0xB7, 6, 0, 0, 0, 1];
        assert_eq!(parse_tcp_server_id(&opts), None);

        // wrong length is skipped over
        let opts = [0xB7, 4, 0, 1];
        assert_eq!(parse_tcp_server_id(&opts), None);

        // truncated option
        assert_eq!(parse_tcp_server_id(&[0xB7, 6, 0, 0]), None);

        // more NOPs than the walk allows
        let mut opts = vec![1u8; MAX_TCP_OPTIONS];
        opts.extend_from_slice(&[0xB7, 6, 0, 0, 0, 1]);
        assert_eq!(parse_tcp_server_id(&opts), None);
    }
}
