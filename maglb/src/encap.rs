//! Tunnel header synthesis.
//!
//! A forwarded frame is the original IP packet behind a fresh Ethernet
//! header, an outer IPv4 or IPv6 header and, for GUE, a UDP header. The
//! original Ethernet header is not carried.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use maglb_common::{real_flags, RealDefinition};
use network_types::{
    eth::EthHdr,
    ip::{IpProto, Ipv4Hdr, Ipv6Hdr},
    udp::UdpHdr,
};

use crate::checksum;
use crate::config::Settings;
use crate::packet::{be16, PacketInfo, ETH_P_IP, ETH_P_IPV6};

const IPPROTO_IPIP: u8 = 4;
const IPPROTO_IPV6: u8 = 41;

/// Outer sources of IP-in-IP packets are drawn from 172.16.0.0/16 (IPv4)
/// and 0100::/64 (IPv6) so that each flow gets a stable, distinct source.
const IPIP_V4_PREFIX: [u8; 2] = [172, 16];
const IPIP_V6_PREFIX: [u8; 2] = [0x01, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncapError {
    /// No tunnel can carry this packet to this real (IPv6 in IPv4, or a GUE
    /// real without a configured source of its family).
    Unencapsulable,
    /// The output buffer or the outer length field cannot hold the result.
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tunnel {
    Ipip,
    Gue { src_port: u16, dst_port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OuterHeader {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub tos: u8,
    pub ttl: u8,
    pub tunnel: Tunnel,
}

impl OuterHeader {
    pub fn overhead(&self) -> usize {
        let ip = match self.dst {
            IpAddr::V4(_) => Ipv4Hdr::LEN,
            IpAddr::V6(_) => Ipv6Hdr::LEN,
        };
        let udp = match self.tunnel {
            Tunnel::Ipip => 0,
            Tunnel::Gue { .. } => UdpHdr::LEN,
        };
        EthHdr::LEN + ip + udp
    }
}

/// Encapsulation settings shared by every shard.
#[derive(Debug, Clone)]
pub struct Encapsulator {
    gateway_mac: [u8; 6],
    default_ttl: u8,
    default_tos: u8,
    copy_inner_tos: bool,
    gue_port: u16,
    lb_src_v4: Option<Ipv4Addr>,
    lb_src_v6: Option<Ipv6Addr>,
}

impl Encapsulator {
    pub fn new(settings: &Settings) -> Self {
        Encapsulator {
            gateway_mac: settings.gateway_mac.0,
            default_ttl: settings.default_ttl,
            default_tos: settings.default_tos,
            copy_inner_tos: settings.copy_inner_tos,
            gue_port: settings.gue_port,
            lb_src_v4: settings.lb_src_v4,
            lb_src_v6: settings.lb_src_v6,
        }
    }

    /// The outer header that carries `info`'s packet to `real`.
    pub fn outer_header(
        &self,
        info: &PacketInfo,
        real: &RealDefinition,
    ) -> Result<OuterHeader, EncapError> {
        let dst = real.ip();
        if info.is_v6() && dst.is_ipv4() {
            return Err(EncapError::Unencapsulable);
        }
        let tos = if self.copy_inner_tos {
            info.tos
        } else {
            self.default_tos
        };

        let (src, tunnel) = if real.flags & real_flags::GUE != 0 {
            let src = match dst {
                IpAddr::V4(_) => self.lb_src_v4.map(IpAddr::V4),
                IpAddr::V6(_) => self.lb_src_v6.map(IpAddr::V6),
            }
            .ok_or(EncapError::Unencapsulable)?;
            let tunnel = Tunnel::Gue {
                src_port: info.src_port,
                dst_port: self.gue_port,
            };
            (src, tunnel)
        } else {
            (ipip_source(info.src, info.src_port, dst.is_ipv6()), Tunnel::Ipip)
        };

        Ok(OuterHeader {
            src,
            dst,
            tos,
            ttl: self.default_ttl,
            tunnel,
        })
    }

    /// Writes the tunneled form of `frame` into `out` and returns its length.
    pub fn encapsulate(
        &self,
        frame: &[u8],
        info: &PacketInfo,
        real: &RealDefinition,
        out: &mut [u8],
    ) -> Result<usize, EncapError> {
        let outer = self.outer_header(info, real)?;
        let inner = frame
            .get(EthHdr::LEN..info.frame_len())
            .ok_or(EncapError::TooLarge)?;
        let mut src_mac = [0u8; 6];
        src_mac.copy_from_slice(&frame[..6]);
        encapsulate(inner, &outer, src_mac, self.gateway_mac, out)
    }
}

/// Per-flow outer source for IP-in-IP. The low 32 bits of the inner source
/// are mixed with the source port so that flows spread across receive
/// queues on the real.
pub fn ipip_source(inner_src: IpAddr, src_port: u16, outer_v6: bool) -> IpAddr {
    let low = match inner_src {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            u32::from_be_bytes([o[12], o[13], o[14], o[15]])
        }
    };
    if outer_v6 {
        let suffix = ((src_port as u32) << 16) ^ low;
        let mut o = [0u8; 16];
        o[..2].copy_from_slice(&IPIP_V6_PREFIX);
        o[12..].copy_from_slice(&suffix.to_be_bytes());
        IpAddr::V6(Ipv6Addr::from(o))
    } else {
        let s = (src_port ^ low as u16).to_be_bytes();
        IpAddr::V4(Ipv4Addr::new(IPIP_V4_PREFIX[0], IPIP_V4_PREFIX[1], s[0], s[1]))
    }
}

/// Builds `eth | outer ip | [udp] | inner` in `out`. `inner` is an IP
/// packet; its version picks the IP-in-IP protocol number.
pub fn encapsulate(
    inner: &[u8],
    outer: &OuterHeader,
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    out: &mut [u8],
) -> Result<usize, EncapError> {
    let inner_v6 = match inner.first().map(|b| b >> 4) {
        Some(4) => false,
        Some(6) => true,
        _ => return Err(EncapError::Unencapsulable),
    };
    let overhead = outer.overhead();
    let total = overhead + inner.len();
    if total > out.len() {
        return Err(EncapError::TooLarge);
    }
    let udp_len = UdpHdr::LEN + inner.len();

    let ip_off = EthHdr::LEN;
    let (l4_off, proto) = match (outer.src, outer.dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            if inner_v6 {
                return Err(EncapError::Unencapsulable);
            }
            let proto = match outer.tunnel {
                Tunnel::Ipip => IPPROTO_IPIP,
                Tunnel::Gue { .. } => IpProto::Udp as u8,
            };
            let ip_total = u16::try_from(total - EthHdr::LEN).map_err(|_| EncapError::TooLarge)?;
            write_v4(&mut out[ip_off..ip_off + Ipv4Hdr::LEN], outer, src, dst, ip_total, proto);
            (ip_off + Ipv4Hdr::LEN, ETH_P_IP)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let next = match outer.tunnel {
                Tunnel::Ipip if inner_v6 => IPPROTO_IPV6,
                Tunnel::Ipip => IPPROTO_IPIP,
                Tunnel::Gue { .. } => IpProto::Udp as u8,
            };
            let payload =
                u16::try_from(total - ip_off - Ipv6Hdr::LEN).map_err(|_| EncapError::TooLarge)?;
            write_v6(&mut out[ip_off..ip_off + Ipv6Hdr::LEN], outer, src, dst, payload, next);
            (ip_off + Ipv6Hdr::LEN, ETH_P_IPV6)
        }
        _ => return Err(EncapError::Unencapsulable),
    };

    out[0..6].copy_from_slice(&dst_mac);
    out[6..12].copy_from_slice(&src_mac);
    out[12..14].copy_from_slice(&proto.to_be_bytes());
    out[overhead..total].copy_from_slice(inner);

    if let Tunnel::Gue { src_port, dst_port } = outer.tunnel {
        let udp_len = u16::try_from(udp_len).map_err(|_| EncapError::TooLarge)?;
        let udp = &mut out[l4_off..l4_off + UdpHdr::LEN];
        udp[0..2].copy_from_slice(&src_port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
        udp[6..8].copy_from_slice(&[0, 0]);
        // zero means "no checksum" over IPv4 but is not allowed over IPv6
        if let (IpAddr::V6(src), IpAddr::V6(dst)) = (outer.src, outer.dst) {
            let csum = checksum::udp_v6(&src, &dst, &out[l4_off..total]);
            out[l4_off + 6..l4_off + 8].copy_from_slice(&csum.to_be_bytes());
        }
    }
    Ok(total)
}

fn write_v4(h: &mut [u8], outer: &OuterHeader, src: Ipv4Addr, dst: Ipv4Addr, total: u16, proto: u8) {
    h[0] = 0x45;
    h[1] = outer.tos;
    h[2..4].copy_from_slice(&total.to_be_bytes());
    h[4..8].copy_from_slice(&[0; 4]);
    h[8] = outer.ttl;
    h[9] = proto;
    h[10..12].copy_from_slice(&[0, 0]);
    h[12..16].copy_from_slice(&src.octets());
    h[16..20].copy_from_slice(&dst.octets());
    let csum = checksum::ipv4_header(h);
    h[10..12].copy_from_slice(&csum.to_be_bytes());
}

fn write_v6(h: &mut [u8], outer: &OuterHeader, src: Ipv6Addr, dst: Ipv6Addr, payload: u16, next: u8) {
    let vtc = (6u32 << 28) | ((outer.tos as u32) << 20);
    h[0..4].copy_from_slice(&vtc.to_be_bytes());
    h[4..6].copy_from_slice(&payload.to_be_bytes());
    h[6] = next;
    h[7] = outer.ttl;
    h[8..24].copy_from_slice(&src.octets());
    h[24..40].copy_from_slice(&dst.octets());
}

/// A tunneled frame taken apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decapsulated<'a> {
    pub outer_src: IpAddr,
    pub outer_dst: IpAddr,
    pub gue: bool,
    /// The carried IP packet.
    pub inner: &'a [u8],
}

/// Strips the Ethernet, outer IP and optional UDP headers written by
/// [`encapsulate`].
pub fn decapsulate(frame: &[u8]) -> Option<Decapsulated<'_>> {
    let off = EthHdr::LEN;
    let (src, dst, proto, l4_off, end) = match be16(frame, 12)? {
        ETH_P_IP => {
            let h = frame.get(off..off + Ipv4Hdr::LEN)?;
            let ihl = (h[0] & 0x0F) as usize * 4;
            let total = u16::from_be_bytes([h[2], h[3]]) as usize;
            let src: [u8; 4] = h[12..16].try_into().ok()?;
            let dst: [u8; 4] = h[16..20].try_into().ok()?;
            (IpAddr::from(src), IpAddr::from(dst), h[9], off + ihl, off + total)
        }
        ETH_P_IPV6 => {
            let h = frame.get(off..off + Ipv6Hdr::LEN)?;
            let payload = u16::from_be_bytes([h[4], h[5]]) as usize;
            let src: [u8; 16] = h[8..24].try_into().ok()?;
            let dst: [u8; 16] = h[24..40].try_into().ok()?;
            (
                IpAddr::from(src),
                IpAddr::from(dst),
                h[6],
                off + Ipv6Hdr::LEN,
                off + Ipv6Hdr::LEN + payload,
            )
        }
        _ => return None,
    };
    let (inner_off, gue) = match proto {
        IPPROTO_IPIP | IPPROTO_IPV6 => (l4_off, false),
        p if p == IpProto::Udp as u8 => (l4_off + UdpHdr::LEN, true),
        _ => return None,
    };
    Some(Decapsulated {
        outer_src: src,
        outer_dst: dst,
        gue,
        inner: frame.get(inner_off..end)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{self, testutil::*};

    fn settings() -> Settings {
        Settings {
            gateway_mac: "02:00:00:00:00:ff".parse().unwrap(),
            lb_src_v4: Some("10.255.0.1".parse().unwrap()),
            lb_src_v6: Some("fc00::1".parse().unwrap()),
            ..Settings::default()
        }
    }

    fn v4_frame() -> Vec<u8> {
        ipv4(
            "192.0.2.1".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            6,
            0x2e,
            &tcp(40000, 80, 0, &[], b"payload"),
        )
    }

    #[test]
    fn ipip_v4_round_trip() {
        let enc = Encapsulator::new(&settings());
        let frame = v4_frame();
        let info = packet::parse(&frame).unwrap();
        let real = RealDefinition::new("10.1.0.1".parse().unwrap(), 0);
        let mut out = [0u8; 256];
        let len = enc.encapsulate(&frame, &info, &real, &mut out).unwrap();
        let out = &out[..len];

        assert_eq!(len, frame.len() + 20);
        assert_eq!(&out[0..6], &[2, 0, 0, 0, 0, 0xff]);
        assert_eq!(&out[6..12], &LB_MAC);
        let ip = &out[14..34];
        assert_eq!(ip[1], 0, "default tos");
        assert_eq!(ip[8], 64);
        assert_eq!(ip[9], IPPROTO_IPIP);
        assert_eq!(u16::from_be_bytes([ip[2], ip[3]]) as usize, len - 14);
        assert_eq!(checksum::ipv4_header(ip), 0);
        assert_eq!(&ip[12..14], &[172, 16]);

        let d = decapsulate(out).unwrap();
        assert!(!d.gue);
        assert_eq!(d.outer_dst, real.ip());
        assert_eq!(d.inner, &frame[14..]);
    }

    #[test]
    fn gue_v6_checksum_verifies() {
        let enc = Encapsulator::new(&settings());
        let frame = v4_frame();
        let info = packet::parse(&frame).unwrap();
        let real = RealDefinition::new("2001:db8:1::1".parse().unwrap(), real_flags::GUE);
        let mut out = [0u8; 256];
        let len = enc.encapsulate(&frame, &info, &real, &mut out).unwrap();
        assert_eq!(len, frame.len() + 40 + 8);

        let ip = &out[14..54];
        assert_eq!(ip[6], 17);
        assert_eq!(u16::from_be_bytes([ip[4], ip[5]]) as usize, len - 54);
        let udp = &out[54..len];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 40000);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 6080);
        assert_eq!(u16::from_be_bytes([udp[4], udp[5]]) as usize, udp.len());

        // summing over the filled-in checksum gives zero
        let src: Ipv6Addr = "fc00::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8:1::1".parse().unwrap();
        let mut acc = checksum::sum(0, &src.octets());
        acc = checksum::sum(acc, &dst.octets());
        acc = checksum::sum(acc, &(udp.len() as u32).to_be_bytes());
        acc = checksum::sum(acc, &[0, 0, 0, 17]);
        acc = checksum::sum(acc, udp);
        assert_eq!(checksum::fold(acc), 0);

        let d = decapsulate(&out[..len]).unwrap();
        assert!(d.gue);
        assert_eq!(d.outer_src, IpAddr::V6(src));
        assert_eq!(d.inner, &frame[14..]);
    }

    #[test]
    fn gue_v4_leaves_checksum_unset() {
        let enc = Encapsulator::new(&settings());
        let frame = v4_frame();
        let info = packet::parse(&frame).unwrap();
        let real = RealDefinition::new("10.1.0.1".parse().unwrap(), real_flags::GUE);
        let mut out = [0u8; 256];
        let len = enc.encapsulate(&frame, &info, &real, &mut out).unwrap();
        assert_eq!(&out[34 + 6..34 + 8], &[0, 0]);
        assert_eq!(&out[14 + 12..14 + 16], &[10, 255, 0, 1]);
        assert_eq!(decapsulate(&out[..len]).unwrap().inner, &frame[14..]);
    }

    #[test]
    fn v6_inner_needs_v6_real() {
        let enc = Encapsulator::new(&settings());
        let frame = ipv6(
            "2001:db8::2".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
            17,
            0,
            &udp(1, 2, b"x"),
        );
        let info = packet::parse(&frame).unwrap();
        let mut out = [0u8; 256];

        let v4_real = RealDefinition::new("10.1.0.1".parse().unwrap(), 0);
        assert_eq!(
            enc.encapsulate(&frame, &info, &v4_real, &mut out),
            Err(EncapError::Unencapsulable)
        );

        let v6_real = RealDefinition::new("2001:db8:1::1".parse().unwrap(), 0);
        let len = enc.encapsulate(&frame, &info, &v6_real, &mut out).unwrap();
        assert_eq!(out[14 + 6], IPPROTO_IPV6);
        assert_eq!(&out[14 + 8..14 + 10], &IPIP_V6_PREFIX);
        assert_eq!(decapsulate(&out[..len]).unwrap().inner, &frame[14..]);
    }

    #[test]
    fn copies_inner_tos_when_asked() {
        let enc = Encapsulator::new(&Settings {
            copy_inner_tos: true,
            ..settings()
        });
        let frame = v4_frame();
        let info = packet::parse(&frame).unwrap();
        let real = RealDefinition::new("10.1.0.1".parse().unwrap(), 0);
        let outer = enc.outer_header(&info, &real).unwrap();
        assert_eq!(outer.tos, 0x2e);
    }

    #[test]
    fn small_buffer_is_rejected() {
        let enc = Encapsulator::new(&settings());
        let frame = v4_frame();
        let info = packet::parse(&frame).unwrap();
        let real = RealDefinition::new("10.1.0.1".parse().unwrap(), 0);
        let mut out = [0u8; 40];
        assert_eq!(
            enc.encapsulate(&frame, &info, &real, &mut out),
            Err(EncapError::TooLarge)
        );
    }

    #[test]
    fn ipip_source_is_per_flow() {
        let src: IpAddr = "192.0.2.1".parse().unwrap();
        let a = ipip_source(src, 1000, false);
        let b = ipip_source(src, 1001, false);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), format!("172.16.{}.{}", 0x03 ^ 0x02, 0xe8 ^ 0x01));
        assert_eq!(a, ipip_source(src, 1000, false));
        let v6 = ipip_source(src, 1000, true);
        assert_eq!(v6.to_string(), format!("100::{:x}:{:x}", 1000u32 ^ 0xc000, 0x0201));
    }
}
