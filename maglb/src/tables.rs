//! Read-mostly tables consulted on the packet path.
//!
//! The control plane publishes a complete [`Tables`] value through an
//! [`ArcSwap`]; a shard loads it once per packet, so every lookup for that
//! packet sees the same generation of every table. Each table is its own
//! `Arc`, which lets the control plane copy only what it changes.

use std::sync::Arc;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use maglb_common::{RealDefinition, RealPosLru, VipDefinition, VipMeta};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::lpm::LpmTable;
use crate::ring::ChRing;
use crate::server_id::ServerIdTable;

#[derive(Debug, Clone)]
pub struct VipTable {
    vips: AHashMap<VipDefinition, VipMeta>,
    max_vips: u32,
}

impl VipTable {
    pub fn new(max_vips: u32) -> Self {
        VipTable {
            vips: AHashMap::with_capacity(max_vips as usize),
            max_vips,
        }
    }

    #[inline]
    pub fn lookup(&self, vip: &VipDefinition) -> Option<VipMeta> {
        self.vips.get(vip).copied()
    }

    pub fn insert(&mut self, vip: VipDefinition, meta: VipMeta) -> Result<()> {
        if !self.vips.contains_key(&vip) && self.vips.len() >= self.max_vips as usize {
            return Err(Error::VipSpaceExhausted { max: self.max_vips });
        }
        self.vips.insert(vip, meta);
        Ok(())
    }

    pub fn remove(&mut self, vip: &VipDefinition) -> Option<VipMeta> {
        self.vips.remove(vip)
    }

    pub fn len(&self) -> usize {
        self.vips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vips.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VipDefinition, &VipMeta)> {
        self.vips.iter()
    }
}

/// Backend id → backend. An id's generation changes whenever the id is
/// released or re-pointed at another address, which invalidates every cache
/// entry written before.
#[derive(Debug, Clone)]
pub struct RealTable {
    slots: Vec<Option<RealDefinition>>,
    generations: Vec<u32>,
}

impl RealTable {
    pub fn new(max_reals: u32) -> Self {
        RealTable {
            slots: vec![None; max_reals as usize],
            generations: vec![0; max_reals as usize],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub fn resolve(&self, id: u32) -> Option<RealDefinition> {
        self.slots.get(id as usize).copied().flatten()
    }

    /// Resolves a cache entry, rejecting it if the id was recycled since.
    #[inline]
    pub fn resolve_entry(&self, entry: RealPosLru) -> Option<RealDefinition> {
        let real = self.resolve(entry.pos)?;
        (self.generations[entry.pos as usize] == entry.generation).then_some(real)
    }

    /// The cache entry to record for a decision on `id`.
    #[inline]
    pub fn entry_for(&self, id: u32) -> RealPosLru {
        RealPosLru {
            pos: id,
            generation: self.generations.get(id as usize).copied().unwrap_or(0),
        }
    }

    pub fn set(&mut self, id: u32, real: RealDefinition) -> Result<()> {
        let max = self.capacity();
        let slot = self
            .slots
            .get_mut(id as usize)
            .ok_or(Error::RealSpaceExhausted { max })?;
        if let Some(old) = slot {
            if old.addr != real.addr {
                self.generations[id as usize] = self.generations[id as usize].wrapping_add(1);
            }
        }
        *slot = Some(real);
        Ok(())
    }

    pub fn clear(&mut self, id: u32) -> Option<RealDefinition> {
        let old = self.slots.get_mut(id as usize)?.take();
        if old.is_some() {
            self.generations[id as usize] = self.generations[id as usize].wrapping_add(1);
        }
        old
    }
}

#[derive(Debug, Clone)]
pub struct Tables {
    pub vips: Arc<VipTable>,
    pub reals: Arc<RealTable>,
    pub ring: Arc<ChRing>,
    pub server_ids: Arc<ServerIdTable>,
    pub lpm: Arc<LpmTable>,
}

impl Tables {
    pub fn new(settings: &Settings) -> Self {
        Tables {
            vips: Arc::new(VipTable::new(settings.max_vips)),
            reals: Arc::new(RealTable::new(settings.max_reals)),
            ring: Arc::new(ChRing::new(settings.max_vips, settings.ring_size)),
            server_ids: Arc::new(ServerIdTable::new(
                settings.server_id_map,
                settings.max_server_ids,
            )),
            lpm: Arc::new(LpmTable::new(settings.max_lpm_src)),
        }
    }

    pub fn shared(self) -> SharedTables {
        Arc::new(ArcSwap::from_pointee(self))
    }
}

pub type SharedTables = Arc<ArcSwap<Tables>>;
