//! Echo replies for VIP addresses.

use network_types::{eth::EthHdr, ip::Ipv4Hdr};

use crate::checksum;
use crate::packet::{
    PacketInfo, ICMPV6_ECHO_REPLY, ICMPV6_ECHO_REQUEST, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST,
};

/// Writes the reply to the echo request in `frame` into `out`, returning
/// its length, or `None` if `out` is too small.
pub fn write_echo_reply(frame: &[u8], info: &PacketInfo, ttl: u8, out: &mut [u8]) -> Option<usize> {
    let len = info.frame_len();
    let out = out.get_mut(..len)?;
    out.copy_from_slice(frame.get(..len)?);

    // ethernet addresses swap
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&out[0..6]);
    out.copy_within(6..12, 0);
    out[6..12].copy_from_slice(&mac);

    let ip = EthHdr::LEN;
    let l4 = info.l4_off;
    if info.is_v6() {
        swap(out, ip + 8, ip + 24, 16);
        out[ip + 7] = ttl;
        set_type(out, l4, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY);
    } else {
        swap(out, ip + 12, ip + 16, 4);
        out[ip + 8] = ttl;
        out[ip + 10] = 0;
        out[ip + 11] = 0;
        let csum = checksum::ipv4_header(&out[ip..l4.max(ip + Ipv4Hdr::LEN)]);
        out[ip + 10..ip + 12].copy_from_slice(&csum.to_be_bytes());
        set_type(out, l4, ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY);
    }
    Some(len)
}

fn swap(buf: &mut [u8], a: usize, b: usize, n: usize) {
    for i in 0..n {
        buf.swap(a + i, b + i);
    }
}

// Address swaps leave the ICMPv6 pseudo-header sum unchanged; only the type
// byte needs an incremental update.
fn set_type(buf: &mut [u8], l4: usize, old: u8, new: u8) {
    let code = buf[l4 + 1];
    buf[l4] = new;
    let check = u16::from_be_bytes([buf[l4 + 2], buf[l4 + 3]]);
    let check = checksum::update16(
        check,
        u16::from_be_bytes([old, code]),
        u16::from_be_bytes([new, code]),
    );
    buf[l4 + 2..l4 + 4].copy_from_slice(&check.to_be_bytes());
}
