//! Consistent hash ring lookup.
//!
//! The ring is `max_vips` segments of `ring_size` slots; a VIP's
//! [`VipMeta::vip_num`] names its segment. Segments are replaced wholesale
//! when the control plane rebuilds a VIP's placement.

use std::sync::Arc;

use maglb_common::{RealDefinition, VipMeta, NO_REAL};

use crate::tables::RealTable;

/// Slots tried per packet before giving up on a VIP.
pub const MAX_RING_PROBES: u32 = 4;

#[derive(Debug, Clone)]
pub struct ChRing {
    ring_size: u32,
    segments: Vec<Option<Arc<[u32]>>>,
}

impl ChRing {
    pub fn new(max_vips: u32, ring_size: u32) -> Self {
        ChRing {
            ring_size,
            segments: vec![None; max_vips as usize],
        }
    }

    pub fn ring_size(&self) -> u32 {
        self.ring_size
    }

    /// Installs the slots of `vip_num`. Returns `false` if the segment does
    /// not exist or `slots` has the wrong length.
    pub fn set_segment(&mut self, vip_num: u32, slots: Arc<[u32]>) -> bool {
        if slots.len() != self.ring_size as usize {
            return false;
        }
        match self.segments.get_mut(vip_num as usize) {
            Some(seg) => {
                *seg = Some(slots);
                true
            }
            None => false,
        }
    }

    pub fn clear_segment(&mut self, vip_num: u32) {
        if let Some(seg) = self.segments.get_mut(vip_num as usize) {
            *seg = None;
        }
    }

    pub fn segment(&self, vip_num: u32) -> Option<&[u32]> {
        self.segments.get(vip_num as usize)?.as_deref()
    }

    #[inline]
    pub fn slot(&self, vip_num: u32, pos: u32) -> u32 {
        self.segment(vip_num)
            .and_then(|s| s.get(pos as usize).copied())
            .unwrap_or(NO_REAL)
    }

    /// Picks the backend for `flow_hash` within the VIP's segment.
    ///
    /// The first slot is `flow_hash % ring_size`. If its backend does not
    /// resolve, further slots are probed by double hashing, at most
    /// [`MAX_RING_PROBES`] slots in total. `None` means every probed slot was
    /// empty or stale.
    pub fn select(
        &self,
        meta: &VipMeta,
        flow_hash: u32,
        reals: &RealTable,
    ) -> Option<(u32, RealDefinition)> {
        let segment = self.segment(meta.vip_num)?;
        let size = segment.len() as u64;
        if size == 0 {
            return None;
        }
        let first = flow_hash as u64 % size;
        let step = if size > 1 {
            1 + (flow_hash.rotate_left(16) ^ 0x9e37_79b9) as u64 % (size - 1)
        } else {
            0
        };

        for i in 0..MAX_RING_PROBES as u64 {
            let pos = (first + i * step) % size;
            let id = segment[pos as usize];
            if id == NO_REAL {
                continue;
            }
            if let Some(real) = reals.resolve(id) {
                return Some((id, real));
            }
        }
        None
    }
}
