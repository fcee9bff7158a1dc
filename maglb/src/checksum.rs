//! Internet checksums (RFC 1071).

use std::net::Ipv6Addr;

use network_types::ip::IpProto;

/// Adds `data` to a running one's-complement sum. An odd trailing byte is
/// padded with zero.
#[inline]
pub fn sum(mut acc: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        acc = acc.wrapping_add(u16::from_be_bytes([c[0], c[1]]) as u32);
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    if let [last] = chunks.remainder() {
        acc = acc.wrapping_add((*last as u32) << 8);
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    acc
}

#[inline]
pub fn fold(mut acc: u32) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    !(acc as u16)
}

/// Checksum of an IPv4 header whose checksum field is zero. Over a header
/// with its checksum filled in, the result is zero.
pub fn ipv4_header(header: &[u8]) -> u16 {
    fold(sum(0, header))
}

/// UDP checksum over IPv6. `segment` is the UDP header (checksum field
/// zeroed) and payload. A computed zero is sent as 0xFFFF.
pub fn udp_v6(src: &Ipv6Addr, dst: &Ipv6Addr, segment: &[u8]) -> u16 {
    let mut acc = sum(0, &src.octets());
    acc = sum(acc, &dst.octets());
    acc = sum(acc, &(segment.len() as u32).to_be_bytes());
    acc = sum(acc, &[0, 0, 0, IpProto::Udp as u8]);
    acc = sum(acc, segment);
    match fold(acc) {
        0 => 0xFFFF,
        c => c,
    }
}

/// RFC 1624 update of `check` after a 16-bit word changed from `old` to
/// `new`.
#[inline]
pub fn update16(check: u16, old: u16, new: u16) -> u16 {
    let acc = (!check as u32) + (!old as u32) + new as u32;
    fold(acc)
}
