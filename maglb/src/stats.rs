//! Traffic counters.
//!
//! Each shard owns a [`ShardStats`] that only it increments, so updates are
//! plain relaxed atomic adds that never contend. [`StatsCollector`] reads
//! all shards and sums them.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use maglb_common::{LbStats, QuicPacketStats};

/// Engine-wide counters, stored after the per-VIP counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalCounter {
    /// v1 packets that consulted the cache, v2 TCP SYNs among them.
    LruTotal,
    /// v1 cache misses, v2 misses of non-SYN TCP packets.
    LruMiss,
    /// v1 hits answered by the shared fallback map.
    LruFallback,
    /// v1 cache hits whose backend no longer resolved.
    LruStale,
    /// v1 packets dropped because no ring slot resolved.
    ChDrop,
    /// v1 routed by connection id, v2 by the ring.
    QuicRouting,
    /// v1 routed by the TCP option, v2 option present but unusable.
    TcpServerIdRouting,
    /// v1 routed by source prefix, v2 fell through.
    SrcRouting,
    IcmpEcho,
    IcmpPtbV4,
    IcmpPtbV6,
    Malformed,
    Unencapsulable,
    /// IP fragments, which carry no complete flow key.
    Fragment,
    /// Frames whose reply or tunnel did not fit the output buffer.
    TooLarge,
}

impl GlobalCounter {
    pub const ALL: [GlobalCounter; 15] = [
        GlobalCounter::LruTotal,
        GlobalCounter::LruMiss,
        GlobalCounter::LruFallback,
        GlobalCounter::LruStale,
        GlobalCounter::ChDrop,
        GlobalCounter::QuicRouting,
        GlobalCounter::TcpServerIdRouting,
        GlobalCounter::SrcRouting,
        GlobalCounter::IcmpEcho,
        GlobalCounter::IcmpPtbV4,
        GlobalCounter::IcmpPtbV6,
        GlobalCounter::Malformed,
        GlobalCounter::Unencapsulable,
        GlobalCounter::Fragment,
        GlobalCounter::TooLarge,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GlobalCounter::LruTotal => "lru_total",
            GlobalCounter::LruMiss => "lru_miss",
            GlobalCounter::LruFallback => "lru_fallback",
            GlobalCounter::LruStale => "lru_stale",
            GlobalCounter::ChDrop => "ch_drop",
            GlobalCounter::QuicRouting => "quic_routing",
            GlobalCounter::TcpServerIdRouting => "tcp_server_id_routing",
            GlobalCounter::SrcRouting => "src_routing",
            GlobalCounter::IcmpEcho => "icmp_echo",
            GlobalCounter::IcmpPtbV4 => "icmp_ptb_v4",
            GlobalCounter::IcmpPtbV6 => "icmp_ptb_v6",
            GlobalCounter::Malformed => "malformed",
            GlobalCounter::Unencapsulable => "unencapsulable",
            GlobalCounter::Fragment => "fragment",
            GlobalCounter::TooLarge => "too_large",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKey {
    /// Packets and bytes of the VIP with this `vip_num`.
    Vip(u32),
    Global(GlobalCounter),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicCounter {
    ChRouted,
    CidInitial,
    CidInvalidServerId,
    CidRouted,
    CidUnknownReal,
    CidV1,
    CidV2,
    CidV3,
    DstMatchInLru,
    DstMismatchInLru,
    DstNotFoundInLru,
}

const QUIC_COUNTERS: usize = 11;

#[derive(Default)]
struct AtomicLbStats {
    v1: AtomicU64,
    v2: AtomicU64,
}

impl AtomicLbStats {
    #[inline]
    fn add(&self, v1: u64, v2: u64) {
        self.v1.fetch_add(v1, Ordering::Relaxed);
        self.v2.fetch_add(v2, Ordering::Relaxed);
    }

    fn load(&self) -> LbStats {
        LbStats {
            v1: self.v1.load(Ordering::Relaxed),
            v2: self.v2.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.v1.store(0, Ordering::Relaxed);
        self.v2.store(0, Ordering::Relaxed);
    }
}

fn atomics<T: Default>(n: usize) -> Box<[T]> {
    (0..n).map(|_| T::default()).collect()
}

/// Counters of one shard.
pub struct ShardStats {
    max_vips: u32,
    lb: Box<[AtomicLbStats]>,
    reals: Box<[AtomicLbStats]>,
    real_misses: Box<[AtomicU32]>,
    quic: Box<[AtomicU64]>,
}

impl ShardStats {
    pub fn new(max_vips: u32, max_reals: u32) -> Self {
        ShardStats {
            max_vips,
            lb: atomics(max_vips as usize + GlobalCounter::ALL.len()),
            reals: atomics(max_reals as usize),
            real_misses: atomics(max_reals as usize),
            quic: atomics(QUIC_COUNTERS),
        }
    }

    fn index(&self, key: CounterKey) -> usize {
        match key {
            CounterKey::Vip(vip_num) => vip_num as usize,
            CounterKey::Global(g) => self.max_vips as usize + g as usize,
        }
    }

    /// Adds to a counter. Out-of-range keys are ignored.
    #[inline]
    pub fn increment(&self, key: CounterKey, v1: u64, v2: u64) {
        if let CounterKey::Vip(n) = key {
            if n >= self.max_vips {
                return;
            }
        }
        if let Some(c) = self.lb.get(self.index(key)) {
            c.add(v1, v2);
        }
    }

    #[inline]
    pub fn increment_real(&self, real: u32, bytes: u64) {
        if let Some(c) = self.reals.get(real as usize) {
            c.add(1, bytes);
        }
    }

    #[inline]
    pub fn increment_real_miss(&self, real: u32) {
        if let Some(c) = self.real_misses.get(real as usize) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn increment_quic(&self, counter: QuicCounter) {
        self.quic[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, key: CounterKey) -> LbStats {
        match key {
            CounterKey::Vip(n) if n >= self.max_vips => LbStats::default(),
            _ => self
                .lb
                .get(self.index(key))
                .map(AtomicLbStats::load)
                .unwrap_or_default(),
        }
    }

    pub fn real(&self, real: u32) -> LbStats {
        self.reals
            .get(real as usize)
            .map(AtomicLbStats::load)
            .unwrap_or_default()
    }

    pub fn real_misses(&self, real: u32) -> u32 {
        self.real_misses
            .get(real as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn quic(&self) -> QuicPacketStats {
        let q = |c: QuicCounter| self.quic[c as usize].load(Ordering::Relaxed);
        QuicPacketStats {
            ch_routed: q(QuicCounter::ChRouted),
            cid_initial: q(QuicCounter::CidInitial),
            cid_invalid_server_id: q(QuicCounter::CidInvalidServerId),
            cid_routed: q(QuicCounter::CidRouted),
            cid_unknown_real: q(QuicCounter::CidUnknownReal),
            cid_v1: q(QuicCounter::CidV1),
            cid_v2: q(QuicCounter::CidV2),
            cid_v3: q(QuicCounter::CidV3),
            dst_match_in_lru: q(QuicCounter::DstMatchInLru),
            dst_mismatch_in_lru: q(QuicCounter::DstMismatchInLru),
            dst_not_found_in_lru: q(QuicCounter::DstNotFoundInLru),
        }
    }

    fn reset_vip(&self, vip_num: u32) {
        if vip_num < self.max_vips {
            self.lb[vip_num as usize].reset();
        }
    }

    fn reset_real(&self, real: u32) {
        if let Some(c) = self.reals.get(real as usize) {
            c.reset();
        }
        if let Some(c) = self.real_misses.get(real as usize) {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// All shards' counters.
#[derive(Clone)]
pub struct StatsCollector {
    shards: Vec<Arc<ShardStats>>,
}

impl StatsCollector {
    pub fn new(shards: usize, max_vips: u32, max_reals: u32) -> Self {
        StatsCollector {
            shards: (0..shards.max(1))
                .map(|_| Arc::new(ShardStats::new(max_vips, max_reals)))
                .collect(),
        }
    }

    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, shard: usize) -> Option<Arc<ShardStats>> {
        self.shards.get(shard).cloned()
    }

    fn sum<T, F>(&self, f: F) -> T
    where
        T: Default + std::ops::AddAssign,
        F: Fn(&ShardStats) -> T,
    {
        let mut total = T::default();
        for s in &self.shards {
            total += f(s.as_ref());
        }
        total
    }

    pub fn get(&self, key: CounterKey) -> LbStats {
        self.sum(|s| s.get(key))
    }

    pub fn real(&self, real: u32) -> LbStats {
        self.sum(|s| s.real(real))
    }

    pub fn real_misses(&self, real: u32) -> u64 {
        self.sum(|s| s.real_misses(real) as u64)
    }

    pub fn quic(&self) -> QuicPacketStats {
        self.sum(|s| s.quic())
    }

    /// Zeroes the counters of a VIP slot about to be handed to a new VIP.
    pub fn reset_vip(&self, vip_num: u32) {
        for s in &self.shards {
            s.reset_vip(vip_num);
        }
    }

    /// Zeroes the counters of a backend id about to be recycled.
    pub fn reset_real(&self, real: u32) {
        for s in &self.shards {
            s.reset_real(real);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_follow_the_vip_counters() {
        let s = ShardStats::new(4, 1);
        s.increment(CounterKey::Vip(3), 1, 100);
        s.increment(CounterKey::Global(GlobalCounter::LruTotal), 1, 0);
        assert_eq!(s.index(CounterKey::Global(GlobalCounter::LruTotal)), 4);
        assert_eq!(s.get(CounterKey::Vip(3)), LbStats { v1: 1, v2: 100 });
        assert_eq!(s.get(CounterKey::Global(GlobalCounter::LruTotal)).v1, 1);

        // a vip number past max_vips must not land on a global counter
        s.increment(CounterKey::Vip(4), 7, 7);
        assert_eq!(s.get(CounterKey::Global(GlobalCounter::LruTotal)).v1, 1);
        assert_eq!(s.get(CounterKey::Vip(4)), LbStats::default());
    }

    #[test]
    fn collector_sums_shards() {
        let c = StatsCollector::new(3, 2, 2);
        for i in 0..3 {
            let s = c.shard(i).unwrap();
            s.increment(CounterKey::Vip(1), 1, 10);
            s.increment_real(1, 10);
            s.increment_real_miss(1);
            s.increment_quic(QuicCounter::CidV2);
        }
        assert_eq!(c.get(CounterKey::Vip(1)), LbStats { v1: 3, v2: 30 });
        assert_eq!(c.real(1), LbStats { v1: 3, v2: 30 });
        assert_eq!(c.real_misses(1), 3);
        assert_eq!(c.quic().cid_v2, 3);
        assert!(c.shard(3).is_none());

        c.reset_real(1);
        assert_eq!(c.real(1), LbStats::default());
        assert_eq!(c.real_misses(1), 0);
    }

    #[test]
    fn global_names_are_unique() {
        let mut names: Vec<_> = GlobalCounter::ALL.iter().map(|g| g.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), GlobalCounter::ALL.len());
    }
}
