#![cfg_attr(not(test), no_std)]

//! Shared table layouts for the maglb forwarding core.
//!
//! Every key and value that the control plane writes and the forwarding
//! engine reads lives here as a `repr(C)` struct so that another
//! implementation using the same tables (for example an XDP program reading
//! BPF maps) sees the same bytes. IPv4 addresses occupy the first four bytes
//! of the 16-byte address fields, the remaining bytes are zero.

use core::mem::size_of;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use network_types::ip::IpProto;

/// Ring entry value marking a slot with no backend.
pub const NO_REAL: u32 = u32::MAX;

/// Flags carried in [`VipMeta::flags`].
pub mod vip_flags {
    /// Hash without the source port.
    pub const HASH_NO_SRC_PORT: u32 = 1 << 0;
    /// Never consult or update the flow affinity cache.
    pub const LRU_BYPASS: u32 = 1 << 1;
    /// Route by the server id embedded in QUIC connection ids.
    pub const QUIC_VIP: u32 = 1 << 2;
    /// Hash on the destination port only.
    pub const HASH_DPORT_ONLY: u32 = 1 << 3;
    /// Consult the source LPM tables before the cache.
    pub const SRC_ROUTING: u32 = 1 << 4;
    /// Keep both ports in the key of a port-wildcard VIP.
    pub const HASH_SRC_DST_PORT: u32 = 1 << 7;
    /// Answer ICMP echo requests sent to the VIP address.
    pub const ICMP_ECHO: u32 = 1 << 10;
    /// Route by the server id carried in a TCP header option.
    pub const TCP_SERVER_ID: u32 = 1 << 11;
}

/// Flags carried in [`RealDefinition::flags`].
pub mod real_flags {
    /// The address is IPv6. Owned by the provisioning code.
    pub const IPV6: u8 = 1 << 0;
    /// Tunnel to this real with GUE instead of IP-in-IP.
    pub const GUE: u8 = 1 << 2;
}

fn addr_bytes(addr: IpAddr) -> [u8; 16] {
    let mut out = [0u8; 16];
    match addr {
        IpAddr::V4(v4) => out[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.copy_from_slice(&v6.octets()),
    }
    out
}

fn v4_of(bytes: &[u8; 16]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Key of the VIP table.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VipDefinition {
    pub vip: [u8; 16],
    /// Network byte order.
    pub port: u16,
    pub proto: u8,
    pub _pad: u8,
}

impl VipDefinition {
    pub fn new(addr: IpAddr, port: u16, proto: IpProto) -> Self {
        Self::from_raw(addr_bytes(addr), port.to_be(), proto as u8)
    }

    /// Builds a key from already encoded fields, `port` in network order.
    pub fn from_raw(vip: [u8; 16], port: u16, proto: u8) -> Self {
        VipDefinition {
            vip,
            port,
            proto,
            _pad: 0,
        }
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.port)
    }

    /// Same definition with the port wildcarded.
    pub fn any_port(&self) -> Self {
        VipDefinition { port: 0, ..*self }
    }
}

/// Value of the VIP table.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct VipMeta {
    pub flags: u32,
    /// Index of the ring segment owned by this VIP.
    pub vip_num: u32,
}

impl VipMeta {
    #[inline]
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// A backend as seen by the forwarding engine.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RealDefinition {
    pub addr: [u8; 16],
    pub flags: u8,
    pub _pad: [u8; 3],
}

impl RealDefinition {
    pub fn new(addr: IpAddr, flags: u8) -> Self {
        let family = match addr {
            IpAddr::V4(_) => 0,
            IpAddr::V6(_) => real_flags::IPV6,
        };
        RealDefinition {
            addr: addr_bytes(addr),
            flags: (flags & !real_flags::IPV6) | family,
            _pad: [0; 3],
        }
    }

    pub fn is_v6(&self) -> bool {
        self.flags & real_flags::IPV6 != 0
    }

    pub fn ip(&self) -> IpAddr {
        if self.is_v6() {
            IpAddr::V6(Ipv6Addr::from(self.addr))
        } else {
            IpAddr::V4(v4_of(&self.addr))
        }
    }
}

/// Flow identity used as the affinity cache key. Ports in network order.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct FlowKey {
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub _pad: [u8; 3],
}

impl FlowKey {
    pub fn new(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16, proto: u8) -> Self {
        FlowKey {
            src: addr_bytes(src),
            dst: addr_bytes(dst),
            src_port: src_port.to_be(),
            dst_port: dst_port.to_be(),
            proto,
            _pad: [0; 3],
        }
    }

    /// The ports as the 32-bit word that follows the addresses on the wire.
    pub fn ports(&self) -> [u8; 4] {
        let s = self.src_port.to_ne_bytes();
        let d = self.dst_port.to_ne_bytes();
        [s[0], s[1], d[0], d[1]]
    }
}

/// Value of the affinity cache.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RealPosLru {
    /// Backend id.
    pub pos: u32,
    /// Generation of the backend id when the entry was written.
    pub generation: u32,
}

/// Packet/byte pair, or two related event counts.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct LbStats {
    pub v1: u64,
    pub v2: u64,
}

impl core::ops::AddAssign for LbStats {
    fn add_assign(&mut self, rhs: Self) {
        self.v1 += rhs.v1;
        self.v2 += rhs.v2;
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct QuicPacketStats {
    pub ch_routed: u64,
    pub cid_initial: u64,
    pub cid_invalid_server_id: u64,
    pub cid_routed: u64,
    pub cid_unknown_real: u64,
    pub cid_v1: u64,
    pub cid_v2: u64,
    pub cid_v3: u64,
    pub dst_match_in_lru: u64,
    pub dst_mismatch_in_lru: u64,
    pub dst_not_found_in_lru: u64,
}

impl core::ops::AddAssign for QuicPacketStats {
    fn add_assign(&mut self, rhs: Self) {
        self.ch_routed += rhs.ch_routed;
        self.cid_initial += rhs.cid_initial;
        self.cid_invalid_server_id += rhs.cid_invalid_server_id;
        self.cid_routed += rhs.cid_routed;
        self.cid_unknown_real += rhs.cid_unknown_real;
        self.cid_v1 += rhs.cid_v1;
        self.cid_v2 += rhs.cid_v2;
        self.cid_v3 += rhs.cid_v3;
        self.dst_match_in_lru += rhs.dst_match_in_lru;
        self.dst_mismatch_in_lru += rhs.dst_mismatch_in_lru;
        self.dst_not_found_in_lru += rhs.dst_not_found_in_lru;
    }
}

/// Source routing key for IPv4 prefixes.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct V4LpmKey {
    pub prefixlen: u32,
    pub addr: [u8; 4],
}

impl V4LpmKey {
    /// Key for `addr/prefixlen` with the host bits cleared.
    pub fn new(addr: Ipv4Addr, prefixlen: u32) -> Self {
        let prefixlen = prefixlen.min(32);
        let mask = if prefixlen == 0 {
            0
        } else {
            u32::MAX << (32 - prefixlen)
        };
        V4LpmKey {
            prefixlen,
            addr: (u32::from(addr) & mask).to_be_bytes(),
        }
    }
}

/// Source routing key for IPv6 prefixes.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct V6LpmKey {
    pub prefixlen: u32,
    pub addr: [u8; 16],
}

impl V6LpmKey {
    pub fn new(addr: Ipv6Addr, prefixlen: u32) -> Self {
        let prefixlen = prefixlen.min(128);
        let mask = if prefixlen == 0 {
            0
        } else {
            u128::MAX << (128 - prefixlen)
        };
        V6LpmKey {
            prefixlen,
            addr: (u128::from(addr) & mask).to_be_bytes(),
        }
    }
}

const _: () = assert!(size_of::<VipDefinition>() == 20);
const _: () = assert!(size_of::<VipMeta>() == 8);
const _: () = assert!(size_of::<RealDefinition>() == 20);
const _: () = assert!(size_of::<FlowKey>() == 40);
const _: () = assert!(size_of::<RealPosLru>() == 8);
const _: () = assert!(size_of::<LbStats>() == 16);
const _: () = assert!(size_of::<V4LpmKey>() == 8);
const _: () = assert!(size_of::<V6LpmKey>() == 20);
