//! The per-shard forwarding engine.
//!
//! [`Forwarder::process`] takes one received frame through classification,
//! backend selection and encapsulation. Once the affinity maps have filled
//! it no longer allocates. It blocks on nothing but the fallback cache lock,
//! and every loop it runs is bounded by a constant or a table capacity.

use std::sync::Arc;

use maglb_common::{vip_flags, FlowKey, RealDefinition, VipDefinition, VipMeta};
use network_types::ip::IpProto;

use crate::cache::{CacheHit, FallbackCache, FlowCache};
use crate::config::Settings;
use crate::encap::{EncapError, Encapsulator};
use crate::icmp;
use crate::packet::{self, IcmpKind, PacketInfo, ParseError};
use crate::server_id::{self, QuicCid};
use crate::stats::{CounterKey, GlobalCounter, QuicCounter, ShardStats};
use crate::tables::{SharedTables, Tables};

const FLOW_HASH_SEED: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Fragment,
    RingExhausted,
    Unencapsulable,
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Transmit the first `len` bytes of the output buffer.
    Tx(usize),
    /// Not ours; hand the frame to the host stack.
    Pass,
    Drop(DropReason),
}

/// How the backend of a packet was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    ServerId,
    SrcRoute,
    Cache,
    Ring,
}

/// Hash of the flow's source address and ports, the input of the ring.
#[inline]
pub fn flow_hash(flow: &FlowKey) -> u32 {
    let mut buf = [0u8; 20];
    buf[..16].copy_from_slice(&flow.src);
    buf[16..].copy_from_slice(&flow.ports());
    mur3::murmurhash3_x86_32(&buf, FLOW_HASH_SEED)
}

/// Clears the flow fields the VIP does not hash on.
#[inline]
pub fn apply_hash_flags(flow: &mut FlowKey, meta: &VipMeta) {
    if meta.has(vip_flags::HASH_DPORT_ONLY) {
        flow.src = [0; 16];
        flow.src_port = 0;
    } else if meta.has(vip_flags::HASH_NO_SRC_PORT) {
        flow.src_port = 0;
    }
}

pub struct Forwarder {
    tables: SharedTables,
    cache: FlowCache,
    stats: Arc<ShardStats>,
    encap: Encapsulator,
    default_ttl: u8,
}

impl Forwarder {
    pub fn new(
        shard: u32,
        settings: &Settings,
        tables: SharedTables,
        fallback: Arc<FallbackCache>,
        stats: Arc<ShardStats>,
    ) -> Self {
        Forwarder {
            tables,
            cache: FlowCache::new(shard, settings.lru_size, fallback),
            stats,
            encap: Encapsulator::new(settings),
            default_ttl: settings.default_ttl,
        }
    }

    pub fn shard(&self) -> u32 {
        self.cache.shard()
    }

    pub fn stats(&self) -> &Arc<ShardStats> {
        &self.stats
    }

    /// Decides the fate of `frame`. A `Tx` verdict refers to `out`.
    pub fn process(&mut self, frame: &[u8], out: &mut [u8]) -> Verdict {
        let info = match packet::parse(frame) {
            Ok(info) => info,
            Err(ParseError::Unsupported) => return Verdict::Pass,
            Err(ParseError::Fragment) => {
                self.count(GlobalCounter::Fragment, 1, 0);
                return Verdict::Drop(DropReason::Fragment);
            }
            Err(ParseError::Malformed) => {
                self.count(GlobalCounter::Malformed, 1, 0);
                return Verdict::Drop(DropReason::Malformed);
            }
        };
        let tables = self.tables.load();

        if info.icmp == Some(IcmpKind::EchoRequest) {
            return self.echo(frame, &info, &tables, out);
        }

        let mut flow = info.flow_key();
        let meta = match lookup_vip(&tables, &mut flow) {
            Some(meta) => meta,
            None => return Verdict::Pass,
        };
        if info.icmp == Some(IcmpKind::TooBig) {
            let counter = if info.is_v6() {
                GlobalCounter::IcmpPtbV6
            } else {
                GlobalCounter::IcmpPtbV4
            };
            self.count(counter, 1, 0);
        }
        apply_hash_flags(&mut flow, &meta);

        let (real_id, real) = match self.select(frame, &info, &flow, &meta, &tables) {
            Some(r) => r,
            None => {
                self.count(GlobalCounter::ChDrop, 1, 0);
                return Verdict::Drop(DropReason::RingExhausted);
            }
        };

        match self.encap.encapsulate(frame, &info, &real, out) {
            Ok(len) => {
                let bytes = info.frame_len() as u64;
                self.stats.increment(CounterKey::Vip(meta.vip_num), 1, bytes);
                self.stats.increment_real(real_id, bytes);
                Verdict::Tx(len)
            }
            Err(EncapError::Unencapsulable) => {
                self.count(GlobalCounter::Unencapsulable, 1, 0);
                Verdict::Drop(DropReason::Unencapsulable)
            }
            Err(EncapError::TooLarge) => {
                self.count(GlobalCounter::TooLarge, 1, 0);
                Verdict::Drop(DropReason::TooLarge)
            }
        }
    }

    fn echo(&mut self, frame: &[u8], info: &PacketInfo, tables: &Tables, out: &mut [u8]) -> Verdict {
        let proto = if info.is_v6() {
            IpProto::Ipv6Icmp
        } else {
            IpProto::Icmp
        };
        let key = VipDefinition::new(info.dst, 0, proto);
        match tables.vips.lookup(&key) {
            Some(meta) if meta.has(vip_flags::ICMP_ECHO) => {
                match icmp::write_echo_reply(frame, info, self.default_ttl, out) {
                    Some(len) => {
                        self.count(GlobalCounter::IcmpEcho, 1, 0);
                        Verdict::Tx(len)
                    }
                    None => {
                        self.count(GlobalCounter::TooLarge, 1, 0);
                        Verdict::Drop(DropReason::TooLarge)
                    }
                }
            }
            _ => Verdict::Pass,
        }
    }

    // Server id, then source route, then cache, then ring. Whatever decided
    // is recorded in the cache unless the VIP bypasses it or the decision
    // came from the cache itself.
    fn select(
        &mut self,
        frame: &[u8],
        info: &PacketInfo,
        flow: &FlowKey,
        meta: &VipMeta,
        tables: &Tables,
    ) -> Option<(u32, RealDefinition)> {
        let use_cache = !meta.has(vip_flags::LRU_BYPASS);
        let quic = meta.has(vip_flags::QUIC_VIP) && info.proto == IpProto::Udp as u8;

        let mut chosen = self
            .server_id_route(frame, info, flow, meta, tables, use_cache)
            .map(|r| (r, Route::ServerId));

        if chosen.is_none() && meta.has(vip_flags::SRC_ROUTING) {
            chosen = self.src_route(info, tables).map(|r| (r, Route::SrcRoute));
        }
        if chosen.is_none() && use_cache {
            chosen = self.cache_route(info, flow, tables).map(|r| (r, Route::Cache));
        }
        if chosen.is_none() {
            chosen = tables
                .ring
                .select(meta, flow_hash(flow), &tables.reals)
                .map(|r| (r, Route::Ring));
            if quic && chosen.is_some() {
                self.stats.increment_quic(QuicCounter::ChRouted);
                self.count(GlobalCounter::QuicRouting, 0, 1);
            }
        }

        let ((id, real), route) = chosen?;
        if use_cache && matches!(route, Route::ServerId | Route::Ring) {
            self.cache.insert(*flow, tables.reals.entry_for(id));
        }
        Some((id, real))
    }

    fn server_id_route(
        &mut self,
        frame: &[u8],
        info: &PacketInfo,
        flow: &FlowKey,
        meta: &VipMeta,
        tables: &Tables,
        use_cache: bool,
    ) -> Option<(u32, RealDefinition)> {
        // ICMP carries the quoted flow, not a connection id
        if info.icmp.is_some() {
            return None;
        }
        let end = info.frame_len();
        let frame = frame.get(..end)?;

        if meta.has(vip_flags::QUIC_VIP) && info.proto == IpProto::Udp as u8 {
            let payload = packet::udp_payload(frame, info.l4_off)?;
            let id = match server_id::parse_quic_cid(payload) {
                QuicCid::ServerId { version, id } => {
                    self.stats.increment_quic(match version {
                        1 => QuicCounter::CidV1,
                        2 => QuicCounter::CidV2,
                        _ => QuicCounter::CidV3,
                    });
                    id
                }
                QuicCid::Initial => {
                    self.stats.increment_quic(QuicCounter::CidInitial);
                    return None;
                }
                QuicCid::UnknownVersion(_) | QuicCid::Invalid => return None,
            };
            let real_id = match tables.server_ids.resolve_embedded_id(id) {
                Some(r) => r,
                None => {
                    self.stats.increment_quic(QuicCounter::CidInvalidServerId);
                    return None;
                }
            };
            let real = match tables.reals.resolve(real_id) {
                Some(real) => real,
                None => {
                    self.stats.increment_quic(QuicCounter::CidUnknownReal);
                    return None;
                }
            };
            if use_cache {
                let counter = match self.cache.lookup(flow) {
                    Some(hit) if hit.entry().pos == real_id => QuicCounter::DstMatchInLru,
                    Some(_) => QuicCounter::DstMismatchInLru,
                    None => QuicCounter::DstNotFoundInLru,
                };
                self.stats.increment_quic(counter);
            }
            self.stats.increment_quic(QuicCounter::CidRouted);
            self.count(GlobalCounter::QuicRouting, 1, 0);
            return Some((real_id, real));
        }

        if meta.has(vip_flags::TCP_SERVER_ID) && info.proto == IpProto::Tcp as u8 && !info.is_syn()
        {
            let options = packet::tcp_options(frame, info.l4_off)?;
            let id = server_id::parse_tcp_server_id(options)?;
            let resolved = tables
                .server_ids
                .resolve_embedded_id(id)
                .and_then(|r| tables.reals.resolve(r).map(|real| (r, real)));
            match resolved {
                Some(_) => self.count(GlobalCounter::TcpServerIdRouting, 1, 0),
                None => self.count(GlobalCounter::TcpServerIdRouting, 0, 1),
            }
            return resolved;
        }
        None
    }

    fn src_route(&mut self, info: &PacketInfo, tables: &Tables) -> Option<(u32, RealDefinition)> {
        let routed = tables
            .lpm
            .lookup(info.src)
            .and_then(|id| tables.reals.resolve(id).map(|real| (id, real)));
        match routed {
            Some(_) => self.count(GlobalCounter::SrcRouting, 1, 0),
            None => self.count(GlobalCounter::SrcRouting, 0, 1),
        }
        routed
    }

    fn cache_route(
        &mut self,
        info: &PacketInfo,
        flow: &FlowKey,
        tables: &Tables,
    ) -> Option<(u32, RealDefinition)> {
        let syn = info.is_syn();
        self.count(GlobalCounter::LruTotal, 1, syn as u64);
        let non_syn_tcp = info.proto == IpProto::Tcp as u8 && !syn;

        // a new connection always takes the ring
        let hit = if syn { None } else { self.cache.lookup(flow) };
        let hit = match hit {
            Some(hit) => hit,
            None => {
                self.count(GlobalCounter::LruMiss, 1, non_syn_tcp as u64);
                return None;
            }
        };

        let entry = hit.entry();
        match tables.reals.resolve_entry(entry) {
            Some(real) => {
                if let CacheHit::Fallback(entry) = hit {
                    self.count(GlobalCounter::LruFallback, 1, 0);
                    if self.cache.has_local() {
                        self.cache.insert(*flow, entry);
                    }
                }
                Some((entry.pos, real))
            }
            None => {
                self.count(GlobalCounter::LruStale, 1, 0);
                self.count(GlobalCounter::LruMiss, 1, non_syn_tcp as u64);
                self.stats.increment_real_miss(entry.pos);
                None
            }
        }
    }

    #[inline]
    fn count(&self, counter: GlobalCounter, v1: u64, v2: u64) {
        self.stats.increment(CounterKey::Global(counter), v1, v2);
    }
}

/// Exact VIP first, then the port wildcard. A wildcard match drops the
/// destination port from the flow unless the VIP hashes on ports.
fn lookup_vip(tables: &Tables, flow: &mut FlowKey) -> Option<VipMeta> {
    let key = VipDefinition::from_raw(flow.dst, flow.dst_port, flow.proto);
    if let Some(meta) = tables.vips.lookup(&key) {
        return Some(meta);
    }
    let meta = tables.vips.lookup(&key.any_port())?;
    if !meta.has(vip_flags::HASH_DPORT_ONLY | vip_flags::HASH_SRC_DST_PORT) {
        flow.dst_port = 0;
    }
    Some(meta)
}
