#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use maglb::cache::FallbackCache;
use maglb::checksum;
use maglb::config::Settings;
use maglb::control::{ControlPlane, NewReal};
use maglb::forwarder::{Forwarder, Verdict};
use maglb::stats::StatsCollector;

pub const CLIENT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
pub const LB_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];
pub const GATEWAY_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0xfe];

pub const TCP: u8 = 6;
pub const UDP: u8 = 17;
pub const ACK: u8 = 0x10;
pub const SYN: u8 = 0x02;

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn settings() -> Settings {
    Settings {
        max_vips: 8,
        max_reals: 16,
        ring_size: 65537,
        lru_size: 1024,
        fallback_lru_size: 1024,
        gateway_mac: maglb::config::MacAddr(GATEWAY_MAC),
        lb_src_v4: Some("10.255.0.1".parse().unwrap()),
        lb_src_v6: Some("fc00::1".parse().unwrap()),
        shards: 1,
        ..Settings::default()
    }
}

pub fn real(addr: &str) -> NewReal {
    NewReal {
        addr: ip(addr),
        weight: 1,
        flags: 0,
    }
}

/// One control plane feeding one forwarder.
pub struct Harness {
    pub control: ControlPlane,
    pub forwarder: Forwarder,
    pub stats: StatsCollector,
    out: Vec<u8>,
}

impl Harness {
    pub fn new(settings: Settings) -> Self {
        let stats = StatsCollector::new(1, settings.max_vips, settings.max_reals);
        let control = ControlPlane::new(settings.clone(), stats.clone());
        let fallback = Arc::new(FallbackCache::new(settings.fallback_lru_size));
        let forwarder = Forwarder::new(
            0,
            &settings,
            control.tables(),
            fallback,
            stats.shard(0).unwrap(),
        );
        Harness {
            control,
            forwarder,
            stats,
            out: vec![0u8; 9216],
        }
    }

    pub fn process(&mut self, frame: &[u8]) -> (Verdict, Vec<u8>) {
        let v = self.forwarder.process(frame, &mut self.out);
        let out = match v {
            Verdict::Tx(n) => self.out[..n].to_vec(),
            _ => Vec::new(),
        };
        (v, out)
    }

    /// Destination of the tunnel the frame was sent into.
    pub fn backend_of(&mut self, frame: &[u8]) -> Option<IpAddr> {
        let (v, out) = self.process(frame);
        match v {
            Verdict::Tx(_) => maglb::encap::decapsulate(&out).map(|d| d.outer_dst),
            _ => None,
        }
    }
}

fn eth(ether_type: u16) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&LB_MAC);
    f.extend_from_slice(&CLIENT_MAC);
    f.extend_from_slice(&ether_type.to_be_bytes());
    f
}

pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, l4: &[u8]) -> Vec<u8> {
    let mut f = eth(0x0800);
    let total = (20 + l4.len()) as u16;
    let mut h = [0u8; 20];
    h[0] = 0x45;
    h[2..4].copy_from_slice(&total.to_be_bytes());
    h[8] = 64;
    h[9] = proto;
    h[12..16].copy_from_slice(&src.octets());
    h[16..20].copy_from_slice(&dst.octets());
    let csum = checksum::ipv4_header(&h);
    h[10..12].copy_from_slice(&csum.to_be_bytes());
    f.extend_from_slice(&h);
    f.extend_from_slice(l4);
    f
}

pub fn ipv6(src: Ipv6Addr, dst: Ipv6Addr, proto: u8, l4: &[u8]) -> Vec<u8> {
    let mut f = eth(0x86DD);
    f.extend_from_slice(&(6u32 << 28).to_be_bytes());
    f.extend_from_slice(&(l4.len() as u16).to_be_bytes());
    f.push(proto);
    f.push(64);
    f.extend_from_slice(&src.octets());
    f.extend_from_slice(&dst.octets());
    f.extend_from_slice(l4);
    f
}

pub fn tcp_segment(sport: u16, dport: u16, flags: u8, options: &[u8]) -> Vec<u8> {
    let mut t = vec![0u8; 20];
    t[0..2].copy_from_slice(&sport.to_be_bytes());
    t[2..4].copy_from_slice(&dport.to_be_bytes());
    t[12] = (((20 + options.len()) / 4) as u8) << 4;
    t[13] = flags;
    t.extend_from_slice(options);
    t.extend_from_slice(b"payload");
    t
}

pub fn udp_datagram(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut u = Vec::new();
    u.extend_from_slice(&sport.to_be_bytes());
    u.extend_from_slice(&dport.to_be_bytes());
    u.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    u.extend_from_slice(&[0, 0]);
    u.extend_from_slice(payload);
    u
}

pub fn tcp_v4(src: &str, sport: u16, dst: &str, dport: u16, flags: u8) -> Vec<u8> {
    ipv4(
        src.parse().unwrap(),
        dst.parse().unwrap(),
        TCP,
        &tcp_segment(sport, dport, flags, &[]),
    )
}

pub fn udp_v4(src: &str, sport: u16, dst: &str, dport: u16, payload: &[u8]) -> Vec<u8> {
    ipv4(
        src.parse().unwrap(),
        dst.parse().unwrap(),
        UDP,
        &udp_datagram(sport, dport, payload),
    )
}
