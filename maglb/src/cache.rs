//! Flow affinity cache.
//!
//! Every shard owns a private bounded LRU that only it writes. One
//! [`FallbackCache`] is shared by all shards: it backs shards that run
//! without a private map and receives the entries a saturated private map
//! displaces, so a flow keeps its backend for a while after local eviction
//! or after moving to another shard.
//!
//! Both maps are [`LruCache`]s sized once at startup. A map allocates an
//! entry node per insert until it first fills; from then on an insert reuses
//! the node of the entry it displaces.

use std::num::NonZeroUsize;
use std::sync::Arc;

use ahash::RandomState;
use lru::LruCache;
use maglb_common::{FlowKey, RealPosLru};
use parking_lot::Mutex;

type FlowLru = LruCache<FlowKey, RealPosLru, RandomState>;

// `None` for a zero capacity.
fn flow_lru(capacity: usize) -> Option<FlowLru> {
    NonZeroUsize::new(capacity).map(|cap| LruCache::with_hasher(cap, RandomState::new()))
}

/// Shared, internally synchronized bounded LRU.
pub struct FallbackCache {
    inner: Option<Mutex<FlowLru>>,
}

impl FallbackCache {
    /// A `capacity` of zero disables the map; every lookup misses.
    pub fn new(capacity: usize) -> Self {
        FallbackCache {
            inner: flow_lru(capacity).map(Mutex::new),
        }
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<RealPosLru> {
        self.inner.as_ref()?.lock().get(key).copied()
    }

    pub fn insert(&self, key: FlowKey, entry: RealPosLru) {
        if let Some(inner) = &self.inner {
            inner.lock().put(key, entry);
        }
    }

    pub fn remove(&self, key: &FlowKey) -> Option<RealPosLru> {
        self.inner.as_ref()?.lock().pop(key)
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |m| m.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheHit {
    Local(RealPosLru),
    Fallback(RealPosLru),
}

impl CacheHit {
    pub fn entry(&self) -> RealPosLru {
        match *self {
            CacheHit::Local(e) | CacheHit::Fallback(e) => e,
        }
    }
}

/// The cache view of one shard.
pub struct FlowCache {
    shard: u32,
    local: Option<FlowLru>,
    fallback: Arc<FallbackCache>,
}

impl FlowCache {
    /// A `local_capacity` of zero leaves the shard without a private map.
    pub fn new(shard: u32, local_capacity: usize, fallback: Arc<FallbackCache>) -> Self {
        FlowCache {
            shard,
            local: flow_lru(local_capacity),
            fallback,
        }
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn has_local(&self) -> bool {
        self.local.is_some()
    }

    /// Shard-local map first, then the shared fallback.
    pub fn lookup(&mut self, key: &FlowKey) -> Option<CacheHit> {
        if let Some(local) = self.local.as_mut() {
            if let Some(entry) = local.get(key) {
                return Some(CacheHit::Local(*entry));
            }
        }
        self.fallback.lookup(key).map(CacheHit::Fallback)
    }

    pub fn insert(&mut self, key: FlowKey, entry: RealPosLru) {
        match self.local.as_mut() {
            // push returns the displaced entry, or the old value of `key`
            Some(local) => match local.push(key, entry) {
                Some((old_key, old_entry)) if old_key != key => {
                    self.fallback.insert(old_key, old_entry);
                }
                _ => {}
            },
            None => self.fallback.insert(key, entry),
        }
    }

    /// Drops `key` from both maps.
    pub fn invalidate(&mut self, key: &FlowKey) {
        if let Some(local) = self.local.as_mut() {
            local.pop(key);
        }
        self.fallback.remove(key);
    }

    pub fn local_len(&self) -> usize {
        self.local.as_ref().map_or(0, |l| l.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u16) -> FlowKey {
        FlowKey::new(
            "192.0.2.1".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            n,
            443,
            6,
        )
    }

    fn entry(pos: u32) -> RealPosLru {
        RealPosLru { pos, generation: 0 }
    }

    #[test]
    fn insert_then_lookup_hits_locally() {
        let mut cache = FlowCache::new(0, 4, Arc::new(FallbackCache::new(4)));
        assert_eq!(cache.lookup(&key(1)), None);
        cache.insert(key(1), entry(3));
        assert_eq!(cache.lookup(&key(1)), Some(CacheHit::Local(entry(3))));
    }

    #[test]
    fn saturated_local_map_spills_into_fallback() {
        let fallback = Arc::new(FallbackCache::new(8));
        let mut cache = FlowCache::new(0, 2, fallback.clone());
        cache.insert(key(1), entry(1));
        cache.insert(key(2), entry(2));
        cache.insert(key(3), entry(3));

        assert_eq!(cache.local_len(), 2);
        assert_eq!(fallback.len(), 1);
        assert_eq!(cache.lookup(&key(1)), Some(CacheHit::Fallback(entry(1))));
        assert_eq!(cache.lookup(&key(3)), Some(CacheHit::Local(entry(3))));
    }

    #[test]
    fn evicted_everywhere_after_capacity_is_exceeded() {
        let mut cache = FlowCache::new(0, 2, Arc::new(FallbackCache::new(1)));
        for n in 1..=4 {
            cache.insert(key(n), entry(n as u32));
        }
        // local holds 3,4; fallback holds only the last spilled key (2)
        assert_eq!(cache.lookup(&key(1)), None);
        assert_eq!(cache.lookup(&key(2)), Some(CacheHit::Fallback(entry(2))));
    }

    #[test]
    fn shard_without_local_map_uses_fallback() {
        let fallback = Arc::new(FallbackCache::new(4));
        let mut cache = FlowCache::new(1, 0, fallback.clone());
        assert!(!cache.has_local());
        cache.insert(key(9), entry(9));
        assert_eq!(fallback.len(), 1);
        assert_eq!(cache.lookup(&key(9)), Some(CacheHit::Fallback(entry(9))));
    }

    #[test]
    fn fallback_is_shared_between_shards() {
        let fallback = Arc::new(FallbackCache::new(4));
        let mut a = FlowCache::new(0, 0, fallback.clone());
        let mut b = FlowCache::new(1, 4, fallback);
        a.insert(key(5), entry(7));
        assert_eq!(b.lookup(&key(5)), Some(CacheHit::Fallback(entry(7))));
    }

    #[test]
    fn invalidate_removes_from_both_maps() {
        let fallback = Arc::new(FallbackCache::new(4));
        let mut cache = FlowCache::new(0, 1, fallback.clone());
        cache.insert(key(1), entry(1));
        cache.insert(key(2), entry(2));
        cache.invalidate(&key(1));
        cache.invalidate(&key(2));
        assert_eq!(cache.lookup(&key(1)), None);
        assert_eq!(cache.lookup(&key(2)), None);
        assert!(fallback.is_empty());
    }

    #[test]
    fn lookups_refresh_recency() {
        let fallback = Arc::new(FallbackCache::new(4));
        let mut cache = FlowCache::new(0, 2, fallback.clone());
        cache.insert(key(1), entry(1));
        cache.insert(key(2), entry(2));
        assert!(cache.lookup(&key(1)).is_some());
        cache.insert(key(3), entry(3));

        assert_eq!(cache.lookup(&key(1)), Some(CacheHit::Local(entry(1))));
        assert_eq!(cache.lookup(&key(2)), Some(CacheHit::Fallback(entry(2))));
    }

    #[test]
    fn rewriting_a_key_does_not_spill() {
        let fallback = Arc::new(FallbackCache::new(4));
        let mut cache = FlowCache::new(0, 2, fallback.clone());
        cache.insert(key(1), entry(1));
        cache.insert(key(1), entry(5));
        assert_eq!(cache.local_len(), 1);
        assert!(fallback.is_empty());
        assert_eq!(cache.lookup(&key(1)), Some(CacheHit::Local(entry(5))));
    }

    #[test]
    fn zero_capacity_fallback_never_hits() {
        let mut cache = FlowCache::new(0, 0, Arc::new(FallbackCache::new(0)));
        cache.insert(key(1), entry(1));
        assert_eq!(cache.lookup(&key(1)), None);
    }
}
