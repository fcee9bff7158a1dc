//! YAML configuration.
//!
//! A config file describes the engine's table sizes and encapsulation
//! settings, the VIPs with their reals, and the optional server-id and
//! source-route mappings. It is validated as a whole before anything is
//! provisioned.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

use maglb_common::{real_flags, vip_flags, VipDefinition};
use network_types::ip::IpProto;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::hash::{is_prime, HashFunction};
use crate::lpm::parse_cidr;
use crate::server_id::ServerIdMode;

// ---------------------------------------------------------------------------
// Top-Level Config
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub vips: Vec<Vip>,
    #[serde(default)]
    pub server_ids: Vec<ServerIdRoute>,
    #[serde(default)]
    pub src_routes: Vec<SrcRoute>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let contents = std::fs::read_to_string(path)?;
        Config::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Config> {
        let config: Config =
            serde_yaml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;
        if s.ring_size < 2 || !is_prime(s.ring_size) {
            return Err(Error::RingSizeNotPrime(s.ring_size));
        }
        if s.max_vips == 0 || s.max_reals == 0 {
            return Err(Error::Config("max_vips and max_reals must be positive".into()));
        }
        if self.vips.len() > s.max_vips as usize {
            return Err(Error::VipSpaceExhausted { max: s.max_vips });
        }

        let mut seen = HashSet::new();
        let mut reals = HashSet::new();
        for vip in &self.vips {
            if !seen.insert(vip.definition()) {
                return Err(Error::Config(format!(
                    "duplicate vip {}:{}/{}",
                    vip.vip,
                    vip.port,
                    vip.proto as u8
                )));
            }
            let icmp = matches!(vip.proto, IpProto::Icmp | IpProto::Ipv6Icmp);
            if icmp && vip.port != 0 {
                return Err(Error::Config(format!("icmp vip {} must use port 0", vip.vip)));
            }
            for real in &vip.real_servers {
                if real.weight == 0 {
                    return Err(Error::Config(format!(
                        "real {} of vip {} has weight 0",
                        real.addr, vip.vip
                    )));
                }
                if real.encap == Encap::Gue {
                    self.check_gue_source(real.addr)?;
                }
                reals.insert(real.addr);
            }
        }
        reals.extend(self.server_ids.iter().map(|r| r.real));
        reals.extend(self.src_routes.iter().map(|r| r.real));
        if reals.len() > s.max_reals as usize {
            return Err(Error::RealSpaceExhausted { max: s.max_reals });
        }

        for route in &self.server_ids {
            if route.id == 0
                || (s.server_id_map == ServerIdMode::Direct && route.id >= s.max_server_ids)
            {
                return Err(Error::ServerIdOutOfRange {
                    id: route.id,
                    max: s.max_server_ids,
                });
            }
        }
        for route in &self.src_routes {
            parse_cidr(&route.prefix)?;
        }
        Ok(())
    }

    fn check_gue_source(&self, real: IpAddr) -> Result<()> {
        let missing = match real {
            IpAddr::V4(_) => self.settings.lb_src_v4.is_none(),
            IpAddr::V6(_) => self.settings.lb_src_v6.is_none(),
        };
        if missing {
            return Err(Error::Config(format!(
                "gue real {real} needs an lb source address of its family"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_vips: u32,
    pub max_reals: u32,
    /// Slots per VIP. Must be prime.
    pub ring_size: u32,
    /// Entries of each shard's private affinity map. 0 disables it.
    pub lru_size: usize,
    pub fallback_lru_size: usize,
    /// Copy the inner TOS / traffic class into the outer header.
    pub copy_inner_tos: bool,
    pub server_id_map: ServerIdMode,
    pub max_server_ids: u32,
    pub default_ttl: u8,
    pub default_tos: u8,
    pub gue_port: u16,
    /// Outer source of GUE packets to IPv4 reals.
    pub lb_src_v4: Option<Ipv4Addr>,
    /// Outer source of GUE packets to IPv6 reals.
    pub lb_src_v6: Option<Ipv6Addr>,
    #[serde(deserialize_with = "deserialize_mac")]
    pub gateway_mac: MacAddr,
    /// Forwarding workers. 0 = one per CPU.
    pub shards: usize,
    pub hash_function: HashFunction,
    pub max_lpm_src: u32,
    pub stats_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_vips: 512,
            max_reals: 4096,
            ring_size: 65537,
            lru_size: 65536,
            fallback_lru_size: 1024,
            copy_inner_tos: false,
            server_id_map: ServerIdMode::Direct,
            max_server_ids: 65536,
            default_ttl: 64,
            default_tos: 0,
            gue_port: 6080,
            lb_src_v4: None,
            lb_src_v6: None,
            gateway_mac: MacAddr::default(),
            shards: 0,
            hash_function: HashFunction::Maglev,
            max_lpm_src: 65536,
            stats_interval_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// VIPs and Reals
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Deserialize)]
pub struct Vip {
    pub vip: IpAddr,
    /// 0 accepts any destination port.
    #[serde(default)]
    pub port: u16,
    #[serde(deserialize_with = "deserialize_ip_proto")]
    pub proto: IpProto,
    #[serde(default)]
    pub flags: Vec<VipFlag>,
    /// Overrides `settings.hash_function` for this VIP.
    #[serde(default)]
    pub hash_function: Option<HashFunction>,
    #[serde(default)]
    pub real_servers: Vec<RealServer>,
}

impl Vip {
    pub fn definition(&self) -> VipDefinition {
        VipDefinition::new(self.vip, self.port, self.proto)
    }

    pub fn flag_bits(&self) -> u32 {
        self.flags.iter().fold(0, |acc, f| acc | f.bits())
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Hash, Clone, Copy)]
pub struct RealServer {
    pub addr: IpAddr,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub encap: Encap,
}

impl RealServer {
    pub fn flag_bits(&self) -> u8 {
        match self.encap {
            Encap::Ipip => 0,
            Encap::Gue => real_flags::GUE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encap {
    #[default]
    Ipip,
    Gue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VipFlag {
    HashNoSrcPort,
    LruBypass,
    Quic,
    HashDportOnly,
    SrcRouting,
    HashSrcDstPort,
    IcmpEcho,
    TcpServerId,
}

impl VipFlag {
    pub fn bits(self) -> u32 {
        match self {
            VipFlag::HashNoSrcPort => vip_flags::HASH_NO_SRC_PORT,
            VipFlag::LruBypass => vip_flags::LRU_BYPASS,
            VipFlag::Quic => vip_flags::QUIC_VIP,
            VipFlag::HashDportOnly => vip_flags::HASH_DPORT_ONLY,
            VipFlag::SrcRouting => vip_flags::SRC_ROUTING,
            VipFlag::HashSrcDstPort => vip_flags::HASH_SRC_DST_PORT,
            VipFlag::IcmpEcho => vip_flags::ICMP_ECHO,
            VipFlag::TcpServerId => vip_flags::TCP_SERVER_ID,
        }
    }
}

// ---------------------------------------------------------------------------
// Server-id and Source Routes
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, Deserialize, Clone, Copy)]
pub struct ServerIdRoute {
    pub id: u32,
    pub real: IpAddr,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Clone)]
pub struct SrcRoute {
    /// `addr/len`
    pub prefix: String,
    pub real: IpAddr,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut mac = [0u8; 6];
        let mut parts = s.split(':');
        for byte in mac.iter_mut() {
            *byte = parts
                .next()
                .filter(|p| p.len() == 2)
                .and_then(|p| u8::from_str_radix(p, 16).ok())
                .ok_or_else(|| Error::Config(format!("invalid mac address {s}")))?;
        }
        if parts.next().is_some() {
            return Err(Error::Config(format!("invalid mac address {s}")));
        }
        Ok(MacAddr(mac))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

fn default_weight() -> u32 {
    1
}

fn deserialize_mac<'de, D>(deserializer: D) -> std::result::Result<MacAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let s = String::deserialize(deserializer)?;
    s.parse().map_err(Error::custom)
}

fn deserialize_ip_proto<'de, D>(deserializer: D) -> std::result::Result<IpProto, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Proto {
        Number(u8),
        Name(String),
    }

    let proto = match Proto::deserialize(deserializer)? {
        Proto::Number(n) => match n {
            1 => Some(IpProto::Icmp),
            6 => Some(IpProto::Tcp),
            17 => Some(IpProto::Udp),
            58 => Some(IpProto::Ipv6Icmp),
            _ => None,
        },
        Proto::Name(name) => match name.to_ascii_lowercase().as_str() {
            "icmp" => Some(IpProto::Icmp),
            "tcp" => Some(IpProto::Tcp),
            "udp" => Some(IpProto::Udp),
            "icmpv6" | "ipv6-icmp" => Some(IpProto::Ipv6Icmp),
            _ => None,
        },
    };
    proto.ok_or_else(|| Error::custom("proto must be one of tcp, udp, icmp, icmpv6"))
}
