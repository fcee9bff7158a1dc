//! Header parsing for the forwarding path.
//!
//! Parsing borrows the frame and copies out only the fields the engine
//! needs. Every read is bounds-checked against the frame, and no loop runs
//! longer than a header's fixed size.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use maglb_common::FlowKey;
use network_types::{
    eth::EthHdr,
    ip::{IpProto, Ipv4Hdr, Ipv6Hdr},
    tcp::TcpHdr,
    udp::UdpHdr,
};

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;

pub const TCP_FLAG_SYN: u8 = 0x02;

const IPV4_MF_AND_OFFSET: u16 = 0x3FFF;
const IPV6_FRAGMENT: u8 = 44;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_FRAG_NEEDED: u8 = 4;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_PACKET_TOO_BIG: u8 = 2;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;
pub const ICMP_HDR_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Not IPv4 or IPv6, or a protocol the engine leaves to the host.
    Unsupported,
    /// Truncated or inconsistent headers.
    Malformed,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpKind {
    EchoRequest,
    /// Fragmentation needed (v4) or packet too big (v6). The flow fields
    /// hold the quoted packet's flow, reversed.
    TooBig,
}

/// Fields of one parsed frame. Ports are in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub tos: u8,
    pub tcp_flags: u8,
    /// Offset of the transport header within the frame.
    pub l4_off: usize,
    /// Length of the IP packet as its header states it.
    pub ip_len: usize,
    pub icmp: Option<IcmpKind>,
}

impl PacketInfo {
    pub fn is_v6(&self) -> bool {
        self.dst.is_ipv6()
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.src, self.dst, self.src_port, self.dst_port, self.proto)
    }

    /// Frame length without any trailing link-layer padding.
    pub fn frame_len(&self) -> usize {
        EthHdr::LEN + self.ip_len
    }

    pub fn is_syn(&self) -> bool {
        self.proto == IpProto::Tcp as u8 && self.tcp_flags & TCP_FLAG_SYN != 0
    }
}

#[inline]
pub(crate) fn be16(buf: &[u8], off: usize) -> Option<u16> {
    let b = buf.get(off..off + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

#[inline]
fn v4_at(buf: &[u8], off: usize) -> Option<Ipv4Addr> {
    let b = buf.get(off..off + 4)?;
    Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
}

#[inline]
fn v6_at(buf: &[u8], off: usize) -> Option<Ipv6Addr> {
    let b: [u8; 16] = buf.get(off..off + 16)?.try_into().ok()?;
    Some(Ipv6Addr::from(b))
}

pub fn ether_type(frame: &[u8]) -> Option<u16> {
    be16(frame, 12)
}

pub fn parse(frame: &[u8]) -> Result<PacketInfo, ParseError> {
    match ether_type(frame).ok_or(ParseError::Malformed)? {
        ETH_P_IP => parse_v4(frame, EthHdr::LEN),
        ETH_P_IPV6 => parse_v6(frame, EthHdr::LEN),
        _ => Err(ParseError::Unsupported),
    }
}

fn parse_v4(frame: &[u8], off: usize) -> Result<PacketInfo, ParseError> {
    let hdr = frame
        .get(off..off + Ipv4Hdr::LEN)
        .ok_or(ParseError::Malformed)?;
    let ihl = (hdr[0] & 0x0F) as usize * 4;
    if hdr[0] >> 4 != 4 || ihl < Ipv4Hdr::LEN {
        return Err(ParseError::Malformed);
    }
    let total = u16::from_be_bytes([hdr[2], hdr[3]]) as usize;
    if total < ihl || off + total > frame.len() {
        return Err(ParseError::Malformed);
    }
    if u16::from_be_bytes([hdr[6], hdr[7]]) & IPV4_MF_AND_OFFSET != 0 {
        return Err(ParseError::Fragment);
    }
    let proto = hdr[9];
    let src = v4_at(hdr, 12).ok_or(ParseError::Malformed)?;
    let dst = v4_at(hdr, 16).ok_or(ParseError::Malformed)?;

    let mut info = PacketInfo {
        src: src.into(),
        dst: dst.into(),
        src_port: 0,
        dst_port: 0,
        proto,
        tos: hdr[1],
        tcp_flags: 0,
        l4_off: off + ihl,
        ip_len: total,
        icmp: None,
    };
    // Transport parsing never looks past the IP payload.
    let packet = &frame[..off + total];
    if proto == IpProto::Icmp as u8 {
        parse_icmp_v4(packet, &mut info)?;
    } else {
        parse_l4(packet, &mut info)?;
    }
    Ok(info)
}

fn parse_v6(frame: &[u8], off: usize) -> Result<PacketInfo, ParseError> {
    let hdr = frame
        .get(off..off + Ipv6Hdr::LEN)
        .ok_or(ParseError::Malformed)?;
    if hdr[0] >> 4 != 6 {
        return Err(ParseError::Malformed);
    }
    let payload = u16::from_be_bytes([hdr[4], hdr[5]]) as usize;
    let total = Ipv6Hdr::LEN + payload;
    if off + total > frame.len() {
        return Err(ParseError::Malformed);
    }
    let proto = hdr[6];
    if proto == IPV6_FRAGMENT {
        return Err(ParseError::Fragment);
    }
    let src = v6_at(hdr, 8).ok_or(ParseError::Malformed)?;
    let dst = v6_at(hdr, 24).ok_or(ParseError::Malformed)?;
    let tos = ((u16::from_be_bytes([hdr[0], hdr[1]]) >> 4) & 0xFF) as u8;

    let mut info = PacketInfo {
        src: src.into(),
        dst: dst.into(),
        src_port: 0,
        dst_port: 0,
        proto,
        tos,
        tcp_flags: 0,
        l4_off: off + Ipv6Hdr::LEN,
        ip_len: total,
        icmp: None,
    };
    let packet = &frame[..off + total];
    if proto == IpProto::Ipv6Icmp as u8 {
        parse_icmp_v6(packet, &mut info)?;
    } else {
        parse_l4(packet, &mut info)?;
    }
    Ok(info)
}

fn parse_l4(packet: &[u8], info: &mut PacketInfo) -> Result<(), ParseError> {
    let off = info.l4_off;
    let need = if info.proto == IpProto::Tcp as u8 {
        TcpHdr::LEN
    } else if info.proto == IpProto::Udp as u8 {
        UdpHdr::LEN
    } else {
        return Err(ParseError::Unsupported);
    };
    if packet.len() < off + need {
        return Err(ParseError::Malformed);
    }
    info.src_port = be16(packet, off).ok_or(ParseError::Malformed)?;
    info.dst_port = be16(packet, off + 2).ok_or(ParseError::Malformed)?;
    if info.proto == IpProto::Tcp as u8 {
        info.tcp_flags = packet[off + 13];
    }
    Ok(())
}

fn parse_icmp_v4(packet: &[u8], info: &mut PacketInfo) -> Result<(), ParseError> {
    let off = info.l4_off;
    let hdr = packet
        .get(off..off + ICMP_HDR_LEN)
        .ok_or(ParseError::Malformed)?;
    match (hdr[0], hdr[1]) {
        (ICMP_ECHO_REQUEST, 0) => {
            info.icmp = Some(IcmpKind::EchoRequest);
            Ok(())
        }
        (ICMP_DEST_UNREACH, ICMP_FRAG_NEEDED) => {
            let inner = off + ICMP_HDR_LEN;
            let ihdr = packet
                .get(inner..inner + Ipv4Hdr::LEN)
                .ok_or(ParseError::Malformed)?;
            let ihl = (ihdr[0] & 0x0F) as usize * 4;
            if ihdr[0] >> 4 != 4 || ihl < Ipv4Hdr::LEN {
                return Err(ParseError::Malformed);
            }
            let quoted_src = v4_at(ihdr, 12).ok_or(ParseError::Malformed)?;
            let quoted_dst = v4_at(ihdr, 16).ok_or(ParseError::Malformed)?;
            reverse_quoted(
                packet,
                info,
                quoted_src.into(),
                quoted_dst.into(),
                ihdr[9],
                inner + ihl,
            )
        }
        _ => Err(ParseError::Unsupported),
    }
}

fn parse_icmp_v6(packet: &[u8], info: &mut PacketInfo) -> Result<(), ParseError> {
    let off = info.l4_off;
    let hdr = packet
        .get(off..off + ICMP_HDR_LEN)
        .ok_or(ParseError::Malformed)?;
    match hdr[0] {
        ICMPV6_ECHO_REQUEST => {
            info.icmp = Some(IcmpKind::EchoRequest);
            Ok(())
        }
        ICMPV6_PACKET_TOO_BIG => {
            let inner = off + ICMP_HDR_LEN;
            let ihdr = packet
                .get(inner..inner + Ipv6Hdr::LEN)
                .ok_or(ParseError::Malformed)?;
            let quoted_src = v6_at(ihdr, 8).ok_or(ParseError::Malformed)?;
            let quoted_dst = v6_at(ihdr, 24).ok_or(ParseError::Malformed)?;
            reverse_quoted(
                packet,
                info,
                quoted_src.into(),
                quoted_dst.into(),
                ihdr[6],
                inner + Ipv6Hdr::LEN,
            )
        }
        _ => Err(ParseError::Unsupported),
    }
}

// The quoted packet went from the VIP to the client; the flow we route is
// the client's, so source and destination swap.
fn reverse_quoted(
    packet: &[u8],
    info: &mut PacketInfo,
    quoted_src: IpAddr,
    quoted_dst: IpAddr,
    quoted_proto: u8,
    ports_off: usize,
) -> Result<(), ParseError> {
    if quoted_proto != IpProto::Tcp as u8 && quoted_proto != IpProto::Udp as u8 {
        return Err(ParseError::Unsupported);
    }
    info.src = quoted_dst;
    info.dst = quoted_src;
    info.src_port = be16(packet, ports_off + 2).ok_or(ParseError::Malformed)?;
    info.dst_port = be16(packet, ports_off).ok_or(ParseError::Malformed)?;
    info.proto = quoted_proto;
    info.icmp = Some(IcmpKind::TooBig);
    Ok(())
}

/// Options area of the TCP header at `l4_off`.
pub fn tcp_options(frame: &[u8], l4_off: usize) -> Option<&[u8]> {
    let doff = (*frame.get(l4_off + 12)? >> 4) as usize * 4;
    if doff < TcpHdr::LEN {
        return None;
    }
    frame.get(l4_off + TcpHdr::LEN..l4_off + doff)
}

/// Payload following the UDP header at `l4_off`.
pub fn udp_payload(frame: &[u8], l4_off: usize) -> Option<&[u8]> {
    frame.get(l4_off + UdpHdr::LEN..)
}
