//! Provisioning of the forwarding tables.
//!
//! [`ControlPlane`] owns the authoritative view of VIPs, reals and routes,
//! hands out VIP numbers and real ids, builds each VIP's ring segment and
//! publishes new [`Tables`] snapshots. Forwarders only ever read published
//! snapshots, so a batch of changes becomes visible to them all at once.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::{debug, info, warn};
use maglb_common::{RealDefinition, VipDefinition, VipMeta};
use network_types::ip::IpProto;

use crate::config::{Config, RealServer, Settings, Vip};
use crate::error::{Error, Result};
use crate::hash::{Endpoint, HashFunction};
use crate::lpm::parse_cidr;
use crate::stats::StatsCollector;
use crate::tables::{SharedTables, Tables};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyAction {
    Add,
    Del,
}

/// A VIP as handed to [`ControlPlane::add_vip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewVip {
    pub addr: IpAddr,
    /// 0 accepts any destination port.
    pub port: u16,
    pub proto: IpProto,
}

impl NewVip {
    pub fn new(addr: IpAddr, port: u16, proto: IpProto) -> Self {
        NewVip { addr, port, proto }
    }

    pub fn definition(&self) -> VipDefinition {
        VipDefinition::new(self.addr, self.port, self.proto)
    }
}

impl From<&Vip> for NewVip {
    fn from(v: &Vip) -> Self {
        NewVip::new(v.vip, v.port, v.proto)
    }
}

/// A real as handed to [`ControlPlane::modify_reals_for_vip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewReal {
    pub addr: IpAddr,
    pub weight: u32,
    pub flags: u8,
}

impl From<&RealServer> for NewReal {
    fn from(r: &RealServer) -> Self {
        NewReal {
            addr: r.addr,
            weight: r.weight,
            flags: r.flag_bits(),
        }
    }
}

#[derive(Clone)]
struct VipState {
    // address as provisioned; the table key does not record the family
    addr: IpAddr,
    meta: VipMeta,
    hash_function: HashFunction,
    // real id -> weight
    reals: BTreeMap<u32, u32>,
}

#[derive(Clone)]
struct RealState {
    id: u32,
    flags: u8,
    // VIP memberships, server-id mappings and source routes holding the id
    refcount: u32,
}

// Everything a failed reconcile has to put back.
struct Checkpoint {
    staged: Tables,
    vips: HashMap<VipDefinition, VipState>,
    free_vip_nums: VecDeque<u32>,
    reals: HashMap<IpAddr, RealState>,
    free_real_ids: VecDeque<u32>,
    server_ids: HashMap<u32, IpAddr>,
    src_routes: HashMap<(IpAddr, u32), IpAddr>,
}

pub struct ControlPlane {
    settings: Settings,
    shared: SharedTables,
    staged: Tables,
    stats: StatsCollector,
    vips: HashMap<VipDefinition, VipState>,
    free_vip_nums: VecDeque<u32>,
    reals: HashMap<IpAddr, RealState>,
    free_real_ids: VecDeque<u32>,
    server_ids: HashMap<u32, IpAddr>,
    src_routes: HashMap<(IpAddr, u32), IpAddr>,
}

impl ControlPlane {
    pub fn new(settings: Settings, stats: StatsCollector) -> Self {
        let staged = Tables::new(&settings);
        let shared = staged.clone().shared();
        ControlPlane {
            free_vip_nums: (0..settings.max_vips).collect(),
            free_real_ids: (0..settings.max_reals).collect(),
            settings,
            shared,
            staged,
            stats,
            vips: HashMap::new(),
            reals: HashMap::new(),
            server_ids: HashMap::new(),
            src_routes: HashMap::new(),
        }
    }

    /// Builds a control plane with `config` applied.
    pub fn from_config(config: &Config, stats: StatsCollector) -> Result<Self> {
        let mut cp = ControlPlane::new(config.settings.clone(), stats);
        cp.apply(config)?;
        Ok(cp)
    }

    /// The handle forwarders read snapshots from.
    pub fn tables(&self) -> SharedTables {
        Arc::clone(&self.shared)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    fn publish(&self) {
        self.shared.store(Arc::new(self.staged.clone()));
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            staged: self.staged.clone(),
            vips: self.vips.clone(),
            free_vip_nums: self.free_vip_nums.clone(),
            reals: self.reals.clone(),
            free_real_ids: self.free_real_ids.clone(),
            server_ids: self.server_ids.clone(),
            src_routes: self.src_routes.clone(),
        }
    }

    fn rollback(&mut self, c: Checkpoint) {
        self.staged = c.staged;
        self.vips = c.vips;
        self.free_vip_nums = c.free_vip_nums;
        self.reals = c.reals;
        self.free_real_ids = c.free_real_ids;
        self.server_ids = c.server_ids;
        self.src_routes = c.src_routes;
    }

    // -----------------------------------------------------------------------
    // VIPs
    // -----------------------------------------------------------------------

    /// Provisions a VIP without reals and returns its table key.
    pub fn add_vip(&mut self, vip: NewVip, flags: u32) -> Result<VipDefinition> {
        self.insert_vip(&vip, flags, self.settings.hash_function)?;
        self.publish();
        Ok(vip.definition())
    }

    pub fn del_vip(&mut self, vip: &VipDefinition) -> Result<()> {
        self.remove_vip(vip)?;
        self.publish();
        Ok(())
    }

    pub fn modify_vip(&mut self, vip: &VipDefinition, flags: u32) -> Result<()> {
        self.set_vip_flags(vip, flags)?;
        self.publish();
        Ok(())
    }

    /// Switches the ring construction of a VIP and rebuilds its ring.
    pub fn change_hash_function(&mut self, vip: &VipDefinition, func: HashFunction) -> Result<()> {
        let state = self.vips.get_mut(vip).ok_or(Error::UnknownVip(*vip))?;
        if state.hash_function != func {
            state.hash_function = func;
            self.rebuild_ring(vip)?;
            self.publish();
        }
        Ok(())
    }

    pub fn vip_meta(&self, vip: &VipDefinition) -> Option<VipMeta> {
        self.vips.get(vip).map(|s| s.meta)
    }

    pub fn vips(&self) -> Vec<VipDefinition> {
        self.vips.keys().copied().collect()
    }

    fn insert_vip(&mut self, new: &NewVip, flags: u32, func: HashFunction) -> Result<()> {
        let vip = new.definition();
        if self.vips.contains_key(&vip) {
            return Err(Error::VipExists(vip));
        }
        let vip_num = self
            .free_vip_nums
            .pop_front()
            .ok_or(Error::VipSpaceExhausted {
                max: self.settings.max_vips,
            })?;
        let meta = VipMeta { flags, vip_num };
        if let Err(e) = Arc::make_mut(&mut self.staged.vips).insert(vip, meta) {
            self.free_vip_nums.push_front(vip_num);
            return Err(e);
        }
        Arc::make_mut(&mut self.staged.ring).clear_segment(vip_num);
        self.stats.reset_vip(vip_num);
        self.vips.insert(
            vip,
            VipState {
                addr: new.addr,
                meta,
                hash_function: func,
                reals: BTreeMap::new(),
            },
        );
        info!(
            "added vip {} proto {} as #{}",
            SocketAddr::new(new.addr, new.port),
            vip.proto,
            vip_num
        );
        Ok(())
    }

    fn remove_vip(&mut self, vip: &VipDefinition) -> Result<()> {
        let state = self.vips.remove(vip).ok_or(Error::UnknownVip(*vip))?;
        Arc::make_mut(&mut self.staged.vips).remove(vip);
        Arc::make_mut(&mut self.staged.ring).clear_segment(state.meta.vip_num);
        for id in state.reals.keys() {
            self.release_real_id(*id);
        }
        self.free_vip_nums.push_back(state.meta.vip_num);
        info!(
            "removed vip {} proto {}",
            SocketAddr::new(state.addr, vip.port()),
            vip.proto
        );
        Ok(())
    }

    fn set_vip_flags(&mut self, vip: &VipDefinition, flags: u32) -> Result<()> {
        let state = self.vips.get_mut(vip).ok_or(Error::UnknownVip(*vip))?;
        if state.meta.flags != flags {
            state.meta.flags = flags;
            Arc::make_mut(&mut self.staged.vips).insert(*vip, state.meta)?;
            debug!("vip #{} flags now {:#x}", state.meta.vip_num, flags);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reals
    // -----------------------------------------------------------------------

    /// Adds reals to, or removes reals from, a VIP and rebuilds its ring.
    /// Adding a real the VIP already has updates its weight and flags.
    pub fn modify_reals_for_vip(
        &mut self,
        action: ModifyAction,
        reals: &[NewReal],
        vip: &VipDefinition,
    ) -> Result<()> {
        let result = self.change_reals(action, reals, vip);
        self.publish();
        result
    }

    /// Changes the encapsulation flags of a provisioned real.
    pub fn modify_real(&mut self, addr: IpAddr, flags: u8) -> Result<()> {
        let state = self.reals.get_mut(&addr).ok_or(Error::UnknownReal(addr))?;
        if state.flags != flags {
            state.flags = flags;
            Arc::make_mut(&mut self.staged.reals).set(state.id, RealDefinition::new(addr, flags))?;
            self.publish();
        }
        Ok(())
    }

    pub fn real_id(&self, addr: &IpAddr) -> Option<u32> {
        self.reals.get(addr).map(|r| r.id)
    }

    /// The reals of a VIP with their weights.
    pub fn reals_for_vip(&self, vip: &VipDefinition) -> Result<Vec<(IpAddr, u32)>> {
        let state = self.vips.get(vip).ok_or(Error::UnknownVip(*vip))?;
        Ok(state
            .reals
            .iter()
            .filter_map(|(id, w)| self.staged.reals.resolve(*id).map(|r| (r.ip(), *w)))
            .collect())
    }

    fn change_reals(
        &mut self,
        action: ModifyAction,
        reals: &[NewReal],
        vip: &VipDefinition,
    ) -> Result<()> {
        if !self.vips.contains_key(vip) {
            return Err(Error::UnknownVip(*vip));
        }
        let mut changed = false;
        let mut result = Ok(());
        for real in reals {
            match action {
                ModifyAction::Add => {
                    let member = self.real_id(&real.addr).filter(|id| {
                        self.vips
                            .get(vip)
                            .map_or(false, |s| s.reals.contains_key(id))
                    });
                    let id = match member {
                        Some(id) => id,
                        None => match self.acquire_real_id(real.addr, real.flags) {
                            Ok(id) => id,
                            Err(e) => {
                                result = Err(e);
                                break;
                            }
                        },
                    };
                    self.update_real_flags(real.addr, real.flags)?;
                    if let Some(state) = self.vips.get_mut(vip) {
                        if state.reals.insert(id, real.weight) != Some(real.weight) {
                            changed = true;
                        }
                    }
                }
                ModifyAction::Del => {
                    let id = match self.real_id(&real.addr) {
                        Some(id) => id,
                        None => {
                            warn!("real {} is not provisioned", real.addr);
                            continue;
                        }
                    };
                    let removed = self
                        .vips
                        .get_mut(vip)
                        .and_then(|s| s.reals.remove(&id))
                        .is_some();
                    if removed {
                        self.release_real_id(id);
                        changed = true;
                    } else {
                        let addr = self.vips.get(vip).map(|s| s.addr);
                        warn!("real {} is not a member of vip {:?}", real.addr, addr);
                    }
                }
            }
        }
        if changed {
            self.rebuild_ring(vip)?;
        }
        result
    }

    fn update_real_flags(&mut self, addr: IpAddr, flags: u8) -> Result<()> {
        if let Some(state) = self.reals.get_mut(&addr) {
            if state.flags != flags {
                state.flags = flags;
                Arc::make_mut(&mut self.staged.reals).set(state.id, RealDefinition::new(addr, flags))?;
            }
        }
        Ok(())
    }

    // Takes a reference on the id of `addr`, allocating one if needed.
    fn acquire_real_id(&mut self, addr: IpAddr, flags: u8) -> Result<u32> {
        if let Some(state) = self.reals.get_mut(&addr) {
            state.refcount += 1;
            return Ok(state.id);
        }
        let id = self
            .free_real_ids
            .pop_front()
            .ok_or(Error::RealSpaceExhausted {
                max: self.settings.max_reals,
            })?;
        Arc::make_mut(&mut self.staged.reals).set(id, RealDefinition::new(addr, flags))?;
        self.stats.reset_real(id);
        self.reals.insert(
            addr,
            RealState {
                id,
                flags,
                refcount: 1,
            },
        );
        debug!("real {} has id {}", addr, id);
        Ok(id)
    }

    // Drops a reference; the last one frees the id and invalidates every
    // cache entry that points at it.
    fn release_real_id(&mut self, id: u32) {
        let addr = match self.reals.iter().find(|(_, s)| s.id == id) {
            Some((addr, _)) => *addr,
            None => return,
        };
        let last = match self.reals.get_mut(&addr) {
            Some(state) => {
                state.refcount = state.refcount.saturating_sub(1);
                state.refcount == 0
            }
            None => false,
        };
        if last {
            self.reals.remove(&addr);
            Arc::make_mut(&mut self.staged.reals).clear(id);
            Arc::make_mut(&mut self.staged.server_ids).remove_real(id);
            self.free_real_ids.push_back(id);
            debug!("released id {} of real {}", id, addr);
        }
    }

    fn rebuild_ring(&mut self, vip: &VipDefinition) -> Result<()> {
        let state = self.vips.get(vip).ok_or(Error::UnknownVip(*vip))?;
        let endpoints: Vec<Endpoint> = state
            .reals
            .iter()
            .filter_map(|(id, weight)| {
                self.staged
                    .reals
                    .resolve(*id)
                    .map(|r| Endpoint::for_real(*id, *weight, r.ip()))
            })
            .collect();
        let ring_size = self.settings.ring_size;
        let slots = state
            .hash_function
            .hasher()
            .generate_hash_ring(&endpoints, ring_size);
        let vip_num = state.meta.vip_num;
        if !Arc::make_mut(&mut self.staged.ring).set_segment(vip_num, Arc::from(slots)) {
            return Err(Error::Config(format!("no ring segment for vip #{vip_num}")));
        }
        debug!("rebuilt ring of vip #{} over {} reals", vip_num, endpoints.len());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Server ids
    // -----------------------------------------------------------------------

    /// Routes connection ids carrying `server_id` to `real`.
    pub fn add_server_id(&mut self, server_id: u32, real: IpAddr) -> Result<()> {
        let result = self.insert_server_id(server_id, real);
        self.publish();
        result
    }

    pub fn del_server_id(&mut self, server_id: u32) -> Result<()> {
        self.remove_server_id(server_id);
        self.publish();
        Ok(())
    }

    fn insert_server_id(&mut self, server_id: u32, real: IpAddr) -> Result<()> {
        if self.server_ids.get(&server_id) == Some(&real) {
            return Ok(());
        }
        self.remove_server_id(server_id);
        let flags = self.reals.get(&real).map_or(0, |r| r.flags);
        let id = self.acquire_real_id(real, flags)?;
        if let Err(e) = Arc::make_mut(&mut self.staged.server_ids).insert(server_id, id) {
            self.release_real_id(id);
            return Err(e);
        }
        self.server_ids.insert(server_id, real);
        Ok(())
    }

    fn remove_server_id(&mut self, server_id: u32) {
        if let Some(real) = self.server_ids.remove(&server_id) {
            Arc::make_mut(&mut self.staged.server_ids).remove(server_id);
            if let Some(id) = self.real_id(&real) {
                self.release_real_id(id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Source routes
    // -----------------------------------------------------------------------

    /// Routes sources within `prefix` (`addr/len`) to `real` on VIPs that
    /// enable source routing.
    pub fn add_src_route(&mut self, prefix: &str, real: IpAddr) -> Result<()> {
        let result = parse_cidr(prefix).and_then(|(a, l)| self.insert_src_route(a, l, real));
        self.publish();
        result
    }

    pub fn del_src_route(&mut self, prefix: &str) -> Result<()> {
        let (addr, len) = parse_cidr(prefix)?;
        self.remove_src_route(addr, len);
        self.publish();
        Ok(())
    }

    fn insert_src_route(&mut self, addr: IpAddr, len: u32, real: IpAddr) -> Result<()> {
        let key = (addr, len);
        if self.src_routes.get(&key) == Some(&real) {
            return Ok(());
        }
        self.remove_src_route(addr, len);
        let flags = self.reals.get(&real).map_or(0, |r| r.flags);
        let id = self.acquire_real_id(real, flags)?;
        if let Err(e) = Arc::make_mut(&mut self.staged.lpm).insert(addr, len, id) {
            self.release_real_id(id);
            return Err(e);
        }
        self.src_routes.insert(key, real);
        Ok(())
    }

    fn remove_src_route(&mut self, addr: IpAddr, len: u32) {
        if let Some(real) = self.src_routes.remove(&(addr, len)) {
            Arc::make_mut(&mut self.staged.lpm).remove(addr, len);
            if let Some(id) = self.real_id(&real) {
                self.release_real_id(id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Makes the tables match `config` and publishes the result as one
    /// snapshot. On error nothing is published and the previous state is
    /// kept. Settings cannot change on a running instance; differences are
    /// logged and ignored.
    pub fn apply(&mut self, config: &Config) -> Result<()> {
        config.validate()?;
        if config.settings != self.settings {
            warn!("settings changed; restart to apply them");
        }
        let saved = self.checkpoint();
        if let Err(e) = self.reconcile(config) {
            self.rollback(saved);
            return Err(e);
        }
        self.publish();
        info!(
            "applied config: {} vips, {} reals, {} server ids, {} source routes",
            self.vips.len(),
            self.reals.len(),
            self.server_ids.len(),
            self.src_routes.len()
        );
        Ok(())
    }

    // Every release runs before any acquire, so ids and VIP numbers freed
    // by the new config are available to it.
    fn reconcile(&mut self, config: &Config) -> Result<()> {
        let wanted: HashMap<VipDefinition, &Vip> =
            config.vips.iter().map(|v| (v.definition(), v)).collect();
        let mut wanted_routes = HashMap::new();
        for route in &config.src_routes {
            wanted_routes.insert(parse_cidr(&route.prefix)?, route.real);
        }

        let gone: Vec<VipDefinition> = self
            .vips
            .keys()
            .filter(|d| !wanted.contains_key(d))
            .copied()
            .collect();
        for vip in &gone {
            self.remove_vip(vip)?;
        }

        for (def, vip) in &wanted {
            if !self.vips.contains_key(def) {
                continue;
            }
            let stale: Vec<NewReal> = self
                .reals_for_vip(def)?
                .into_iter()
                .filter(|(addr, _)| !vip.real_servers.iter().any(|r| r.addr == *addr))
                .map(|(addr, weight)| NewReal {
                    addr,
                    weight,
                    flags: 0,
                })
                .collect();
            if !stale.is_empty() {
                self.change_reals(ModifyAction::Del, &stale, def)?;
            }
        }

        let gone: Vec<u32> = self
            .server_ids
            .iter()
            .filter(|(id, real)| !config.server_ids.iter().any(|r| r.id == **id && r.real == **real))
            .map(|(id, _)| *id)
            .collect();
        for id in gone {
            self.remove_server_id(id);
        }

        let gone: Vec<(IpAddr, u32)> = self
            .src_routes
            .iter()
            .filter(|(k, real)| wanted_routes.get(*k) != Some(*real))
            .map(|(k, _)| *k)
            .collect();
        for (addr, len) in gone {
            self.remove_src_route(addr, len);
        }

        for vip in &config.vips {
            let def = vip.definition();
            let func = vip.hash_function.unwrap_or(self.settings.hash_function);
            match self.vips.get_mut(&def) {
                Some(state) => {
                    let rebuild = state.hash_function != func;
                    state.hash_function = func;
                    self.set_vip_flags(&def, vip.flag_bits())?;
                    if rebuild {
                        self.rebuild_ring(&def)?;
                    }
                }
                None => self.insert_vip(&NewVip::from(vip), vip.flag_bits(), func)?,
            }
            let fresh: Vec<NewReal> = vip.real_servers.iter().map(NewReal::from).collect();
            self.change_reals(ModifyAction::Add, &fresh, &def)?;
        }

        for route in &config.server_ids {
            self.insert_server_id(route.id, route.real)?;
        }
        for ((addr, len), real) in wanted_routes {
            self.insert_src_route(addr, len, real)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maglb_common::NO_REAL;
    use network_types::ip::IpProto;

    fn settings() -> Settings {
        Settings {
            max_vips: 4,
            max_reals: 4,
            ring_size: 13,
            ..Settings::default()
        }
    }

    fn cp() -> ControlPlane {
        ControlPlane::new(settings(), StatsCollector::new(1, 4, 4))
    }

    fn new_vip(last: u8) -> NewVip {
        NewVip::new(IpAddr::from([10, 0, 0, last]), 80, IpProto::Tcp)
    }

    fn vip(last: u8) -> VipDefinition {
        new_vip(last).definition()
    }

    fn real(last: u8) -> NewReal {
        NewReal {
            addr: IpAddr::from([10, 1, 0, last]),
            weight: 1,
            flags: 0,
        }
    }

    #[test]
    fn vip_numbers_are_recycled() {
        let mut cp = cp();
        for i in 0..4 {
            cp.add_vip(new_vip(i), 0).unwrap();
        }
        assert!(matches!(cp.add_vip(new_vip(9), 0), Err(Error::VipSpaceExhausted { max: 4 })));
        assert!(matches!(cp.add_vip(new_vip(0), 0), Err(Error::VipExists(_))));

        let freed = cp.vip_meta(&vip(2)).unwrap().vip_num;
        cp.del_vip(&vip(2)).unwrap();
        cp.add_vip(new_vip(9), 0).unwrap();
        assert_eq!(cp.vip_meta(&vip(9)).unwrap().vip_num, freed);
        assert!(cp.tables().load().vips.lookup(&vip(2)).is_none());
    }

    #[test]
    fn ring_follows_membership() {
        let mut cp = cp();
        cp.add_vip(new_vip(1), 0).unwrap();
        let meta = cp.vip_meta(&vip(1)).unwrap();
        assert!(cp.tables().load().ring.segment(meta.vip_num).is_none());

        cp.modify_reals_for_vip(ModifyAction::Add, &[real(1), real(2)], &vip(1))
            .unwrap();
        let ids = [
            cp.real_id(&real(1).addr).unwrap(),
            cp.real_id(&real(2).addr).unwrap(),
        ];
        let tables = cp.tables().load_full();
        let seg = tables.ring.segment(meta.vip_num).unwrap();
        assert_eq!(seg.len(), 13);
        assert!(seg.iter().all(|id| ids.contains(id)));

        cp.modify_reals_for_vip(ModifyAction::Del, &[real(1), real(2)], &vip(1))
            .unwrap();
        let tables = cp.tables().load_full();
        let seg = tables.ring.segment(meta.vip_num).unwrap();
        assert!(seg.iter().all(|id| *id == NO_REAL));
        assert_eq!(cp.real_id(&real(1).addr), None);
    }

    #[test]
    fn shared_reals_are_refcounted() {
        let mut cp = cp();
        cp.add_vip(new_vip(1), 0).unwrap();
        cp.add_vip(new_vip(2), 0).unwrap();
        cp.modify_reals_for_vip(ModifyAction::Add, &[real(1)], &vip(1)).unwrap();
        cp.modify_reals_for_vip(ModifyAction::Add, &[real(1)], &vip(2)).unwrap();
        let id = cp.real_id(&real(1).addr).unwrap();

        cp.del_vip(&vip(1)).unwrap();
        assert_eq!(cp.real_id(&real(1).addr), Some(id));
        cp.del_vip(&vip(2)).unwrap();
        assert_eq!(cp.real_id(&real(1).addr), None);
        assert!(cp.tables().load().reals.resolve(id).is_none());
    }

    #[test]
    fn recycled_ids_invalidate_cache_entries() {
        let mut cp = cp();
        cp.add_vip(new_vip(1), 0).unwrap();
        cp.modify_reals_for_vip(ModifyAction::Add, &[real(1)], &vip(1)).unwrap();
        let id = cp.real_id(&real(1).addr).unwrap();
        let entry = cp.tables().load().reals.entry_for(id);

        cp.modify_reals_for_vip(ModifyAction::Del, &[real(1)], &vip(1)).unwrap();
        // fill every id so the old one comes back for a new address
        let fresh: Vec<NewReal> = (2..6).map(real).collect();
        cp.modify_reals_for_vip(ModifyAction::Add, &fresh, &vip(1)).unwrap();
        let tables = cp.tables().load_full();
        assert!(tables.reals.resolve(id).is_some());
        assert_eq!(tables.reals.resolve_entry(entry), None);
    }

    #[test]
    fn real_space_is_bounded() {
        let mut cp = cp();
        cp.add_vip(new_vip(1), 0).unwrap();
        let reals: Vec<NewReal> = (1..=5).map(real).collect();
        assert!(matches!(
            cp.modify_reals_for_vip(ModifyAction::Add, &reals, &vip(1)),
            Err(Error::RealSpaceExhausted { max: 4 })
        ));
        // what fit is still provisioned and placed
        assert_eq!(cp.reals_for_vip(&vip(1)).unwrap().len(), 4);
        let meta = cp.vip_meta(&vip(1)).unwrap();
        assert!(cp.tables().load().ring.segment(meta.vip_num).is_some());
    }

    #[test]
    fn server_ids_hold_a_reference() {
        let mut cp = cp();
        let addr = real(1).addr;
        cp.add_server_id(7, addr).unwrap();
        let id = cp.real_id(&addr).unwrap();
        assert_eq!(cp.tables().load().server_ids.resolve_embedded_id(7), Some(id));

        cp.del_server_id(7).unwrap();
        assert_eq!(cp.real_id(&addr), None);
        assert_eq!(cp.tables().load().server_ids.resolve_embedded_id(7), None);
    }

    #[test]
    fn apply_reconciles() {
        let first = Config::from_yaml(
            r#"
settings: {max_vips: 4, max_reals: 4, ring_size: 13}
vips:
  - vip: 10.0.0.1
    port: 80
    proto: tcp
    real_servers: [{addr: 10.1.0.1}, {addr: 10.1.0.2}]
  - vip: 10.0.0.2
    port: 80
    proto: tcp
    real_servers: [{addr: 10.1.0.3}]
src_routes:
  - {prefix: 192.168.0.0/16, real: 10.1.0.3}
"#,
        )
        .unwrap();
        let second = Config::from_yaml(
            r#"
settings: {max_vips: 4, max_reals: 4, ring_size: 13}
vips:
  - vip: 10.0.0.1
    port: 80
    proto: tcp
    flags: [lru_bypass]
    real_servers: [{addr: 10.1.0.2, weight: 2}, {addr: 10.1.0.4, encap: ipip}]
"#,
        )
        .unwrap();

        let mut cp = ControlPlane::from_config(&first, StatsCollector::new(1, 4, 4)).unwrap();
        assert_eq!(cp.vips().len(), 2);
        let kept = cp.real_id(&real(2).addr).unwrap();

        cp.apply(&second).unwrap();
        assert_eq!(cp.vips(), vec![vip(1)]);
        assert_eq!(
            cp.vip_meta(&vip(1)).unwrap().flags,
            maglb_common::vip_flags::LRU_BYPASS
        );
        let mut reals = cp.reals_for_vip(&vip(1)).unwrap();
        reals.sort();
        assert_eq!(reals, vec![(real(2).addr, 2), (real(4).addr, 1)]);
        // a real that stays keeps its id
        assert_eq!(cp.real_id(&real(2).addr), Some(kept));
        assert_eq!(cp.real_id(&real(1).addr), None);
        assert_eq!(cp.real_id(&real(3).addr), None);
        assert!(cp.tables().load().lpm.is_empty());
    }

    const TWO_REALS: &str = r#"
settings: {max_vips: 4, max_reals: 2, ring_size: 13}
vips:
  - vip: 10.0.0.1
    port: 80
    proto: tcp
    real_servers: [{addr: 10.1.0.1}]
  - vip: 10.0.0.2
    port: 80
    proto: tcp
    real_servers: [{addr: 10.1.0.2}]
"#;

    #[test]
    fn reals_move_between_vips_at_capacity() {
        let first = Config::from_yaml(TWO_REALS).unwrap();
        // 10.1.0.2 goes away while 10.1.0.3 arrives on the other vip
        let second = Config::from_yaml(
            r#"
settings: {max_vips: 4, max_reals: 2, ring_size: 13}
vips:
  - vip: 10.0.0.1
    port: 80
    proto: tcp
    real_servers: [{addr: 10.1.0.1}, {addr: 10.1.0.3}]
  - vip: 10.0.0.2
    port: 80
    proto: tcp
    real_servers: [{addr: 10.1.0.1}]
"#,
        )
        .unwrap();

        let mut cp = ControlPlane::from_config(&first, StatsCollector::new(1, 4, 2)).unwrap();
        cp.apply(&second).unwrap();

        let mut reals = cp.reals_for_vip(&vip(1)).unwrap();
        reals.sort();
        assert_eq!(reals, vec![(real(1).addr, 1), (real(3).addr, 1)]);
        assert_eq!(cp.reals_for_vip(&vip(2)).unwrap(), vec![(real(1).addr, 1)]);
        assert_eq!(cp.real_id(&real(2).addr), None);
    }

    #[test]
    fn failed_apply_keeps_the_published_tables() {
        let first = Config::from_yaml(TWO_REALS).unwrap();
        let mut cp = ControlPlane::from_config(&first, StatsCollector::new(1, 4, 2)).unwrap();
        let before = cp.tables().load_full();
        let kept = cp.real_id(&real(2).addr).unwrap();

        // valid on its own terms, but this instance only has two real ids
        let bigger = Config::from_yaml(
            r#"
settings: {max_vips: 4, max_reals: 8, ring_size: 13}
vips:
  - vip: 10.0.0.2
    port: 80
    proto: tcp
    real_servers: [{addr: 10.1.0.4}, {addr: 10.1.0.5}, {addr: 10.1.0.6}]
"#,
        )
        .unwrap();
        assert!(matches!(
            cp.apply(&bigger),
            Err(Error::RealSpaceExhausted { max: 2 })
        ));

        assert!(Arc::ptr_eq(&before, &cp.tables().load_full()));
        let mut vips = cp.vips();
        vips.sort_by_key(|d| d.vip);
        assert_eq!(vips, vec![vip(1), vip(2)]);
        assert_eq!(cp.reals_for_vip(&vip(2)).unwrap(), vec![(real(2).addr, 1)]);
        assert_eq!(cp.real_id(&real(2).addr), Some(kept));

        // the rolled back state still accepts a good config
        cp.apply(&first).unwrap();
        assert_eq!(cp.reals_for_vip(&vip(1)).unwrap(), vec![(real(1).addr, 1)]);
    }

    #[test]
    fn v6_vips_keep_their_family() {
        let mut cp = cp();
        let addr: IpAddr = "2001:db8::".parse().unwrap();
        let def = cp.add_vip(NewVip::new(addr, 443, IpProto::Tcp), 0).unwrap();
        assert_eq!(cp.vips.get(&def).map(|s| s.addr), Some(addr));
        assert!(cp.vip_meta(&def).is_some());
    }
}
