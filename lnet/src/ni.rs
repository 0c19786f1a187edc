// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network interfaces and their reference counts.
//!
//! An interface is referenced per partition: taking a reference on partition `cpt`
//! only touches that partition's counter, under that partition's lock. The first
//! reference on a partition, and the release of the last one, also move the "big"
//! count, under the default lock. The big count is thus the number of partitions
//! holding references. When it drops to zero the interface becomes a zombie, to be
//! shut down by its driver outside of any lock.

use crate::errors::LNetError;
use crate::lnd::{Lnd, NiSetup};
use crate::net::NetState;
use crate::nid::{NetId, Nid, ProcessId};
use std::any::Any;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

tracectl::trace_target!("ni", tracectl::LevelFilter::INFO, &["lnet"]);

/// Status of an interface that is up, as published in ping replies
pub const NI_STATUS_UP: u32 = 0x15aa_c0de;
/// Status of an interface that is down
pub const NI_STATUS_DOWN: u32 = 0xdead_face;

/// Two-level reference count of an interface
#[derive(Debug)]
pub struct NiRefs {
    per_cpt: Box<[AtomicU32]>,
    big: AtomicU32,
}

impl NiRefs {
    pub(crate) fn new(ncpts: usize) -> Self {
        Self {
            per_cpt: (0..ncpts).map(|_| AtomicU32::new(0)).collect(),
            big: AtomicU32::new(0),
        }
    }

    /// Take a reference on `cpt`; true if it is the first one on that partition.
    /// The caller holds the lock of partition `cpt`.
    pub(crate) fn get(&self, cpt: usize) -> bool {
        let refs = &self.per_cpt[cpt];
        let old = refs.load(Ordering::Relaxed);
        refs.store(old + 1, Ordering::Relaxed);
        old == 0
    }

    /// Drop a reference on `cpt`; true if it was the last one on that partition.
    /// The caller holds the lock of partition `cpt`.
    pub(crate) fn put(&self, cpt: usize) -> bool {
        let refs = &self.per_cpt[cpt];
        let old = refs.load(Ordering::Relaxed);
        assert!(old > 0, "interface refcount underflow on partition {cpt}");
        refs.store(old - 1, Ordering::Relaxed);
        old == 1
    }

    /// Count one more partition holding references
    pub(crate) fn promote(&self, _registry: &mut NiRegistry) {
        let old = self.big.load(Ordering::Relaxed);
        self.big.store(old + 1, Ordering::Relaxed);
    }

    /// Count one partition less; true when none is left
    pub(crate) fn demote(&self, _registry: &mut NiRegistry) -> bool {
        let old = self.big.load(Ordering::Relaxed);
        assert!(old > 0, "interface big refcount underflow");
        self.big.store(old - 1, Ordering::Relaxed);
        old == 1
    }

    /// Partitions holding references
    #[must_use]
    pub fn big(&self) -> u32 {
        self.big.load(Ordering::Relaxed)
    }

    /// References held on partition `cpt`
    #[must_use]
    pub fn on(&self, cpt: usize) -> u32 {
        self.per_cpt.get(cpt).map_or(0, |r| r.load(Ordering::Relaxed))
    }
}

/// A local network interface
pub struct Ni {
    pub nid: Nid,
    pub lnd: Arc<dyn Lnd>,
    pub interfaces: Vec<String>,
    /// Partitions this interface is bound to, if any
    pub cpts: Option<Vec<usize>>,
    pub maxtxcredits: u32,
    pub peertxcredits: u32,
    pub peerrtrcredits: u32,
    pub peertimeout: Option<u32>,
    status: AtomicU32,
    /// Coarse time the interface last received something
    last_alive: AtomicU64,
    pub(crate) refs: NiRefs,
    data: Option<Box<dyn Any + Send + Sync>>,
}

impl Ni {
    pub(crate) fn new(setup: NiSetup, lnd: Arc<dyn Lnd>, ncpts: usize) -> Self {
        Self {
            nid: setup.nid,
            lnd,
            interfaces: setup.interfaces,
            cpts: setup.cpts,
            maxtxcredits: setup.maxtxcredits,
            peertxcredits: setup.peertxcredits,
            peerrtrcredits: setup.peerrtrcredits,
            peertimeout: setup.peertimeout,
            status: AtomicU32::new(NI_STATUS_UP),
            last_alive: AtomicU64::new(0),
            refs: NiRefs::new(ncpts),
            data: setup.data,
        }
    }

    #[must_use]
    pub fn net(&self) -> NetId {
        self.nid.net()
    }

    #[must_use]
    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Relaxed)
    }

    pub fn set_status(&self, status: u32) {
        self.status.store(status, Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_alive(&self) -> u64 {
        self.last_alive.load(Ordering::Relaxed)
    }

    /// Note traffic at coarse time `now`; returns whether it is news
    pub(crate) fn touch(&self, now: u64) -> bool {
        self.last_alive.fetch_max(now, Ordering::Relaxed) < now
    }

    #[must_use]
    pub fn refs(&self) -> &NiRefs {
        &self.refs
    }

    /// Driver private state set at startup
    #[must_use]
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_ref()?.downcast_ref()
    }
}

impl std::fmt::Debug for Ni {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ni")
            .field("nid", &self.nid)
            .field("interfaces", &self.interfaces)
            .field("cpts", &self.cpts)
            .field("refs", &self.refs)
            .finish_non_exhaustive()
    }
}

/// The interfaces of an LNet instance. Lives behind the default network lock.
#[derive(Debug, Default)]
pub struct NiRegistry {
    pub(crate) nis: Vec<Arc<Ni>>,
    /// Interfaces bound to partitions
    pub(crate) cpt_nis: Vec<Arc<Ni>>,
    pub(crate) zombies: VecDeque<Arc<Ni>>,
    /// Interfaces unlinked and not yet shut down
    pub(crate) nzombie: usize,
    pub(crate) loni: Option<Arc<Ni>>,
    pub(crate) eqwait_ni: Option<Arc<Ni>>,
    pub(crate) shutdown: bool,
}

impl NiRegistry {
    /// Take a reference on `cpt`. The caller holds partition `cpt` and the default lock.
    pub(crate) fn addref_locked(&mut self, ni: &Ni, cpt: usize) {
        if ni.refs.get(cpt) {
            ni.refs.promote(self);
        }
    }

    /// Drop a reference on `cpt`. The caller holds partition `cpt` and the default
    /// lock. Returns true if the interface just became a zombie.
    pub(crate) fn decref_locked(&mut self, ni: &Arc<Ni>, cpt: usize) -> bool {
        if !(ni.refs.put(cpt) && ni.refs.demote(self)) {
            return false;
        }
        assert!(
            !self.nis.iter().any(|n| Arc::ptr_eq(n, ni)),
            "interface {} released while still listed",
            ni.nid
        );
        debug!("interface {} is a zombie", ni.nid);
        self.zombies.push_back(ni.clone());
        true
    }

    /// Add a started interface, with the reference of the list itself
    pub(crate) fn insert(&mut self, ni: Arc<Ni>) {
        self.addref_locked(&ni, 0);
        if ni.cpts.is_some() {
            self.cpt_nis.push(ni.clone());
        }
        self.nis.push(ni);
    }

    #[must_use]
    pub fn find_net(&self, net: NetId) -> Option<&Arc<Ni>> {
        self.nis.iter().find(|ni| ni.net() == net)
    }

    #[must_use]
    pub fn find_nid(&self, nid: Nid) -> Option<&Arc<Ni>> {
        self.nis.iter().find(|ni| ni.nid == nid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nis.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nis.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Ni>> {
        self.nis.iter()
    }
}

/// A counted reference to an interface, dropped on the partition it was taken on
pub struct NiRef<'a> {
    state: &'a NetState,
    ni: Arc<Ni>,
    cpt: usize,
}

impl NiRef<'_> {
    #[must_use]
    pub fn ni(&self) -> &Arc<Ni> {
        &self.ni
    }
}

impl Deref for NiRef<'_> {
    type Target = Ni;
    fn deref(&self) -> &Ni {
        &self.ni
    }
}

impl Drop for NiRef<'_> {
    fn drop(&mut self) {
        self.state.ni_decref(&self.ni, self.cpt);
    }
}

impl NetState {
    /// Take a reference on `ni` on partition `cpt`
    pub(crate) fn ni_addref(&self, ni: &Arc<Ni>, cpt: usize) {
        let _part = self.net.lock(cpt);
        if ni.refs.get(cpt) {
            let mut shared = self.net.lock_default();
            ni.refs.promote(&mut shared.ni);
        }
    }

    /// Drop a reference on `ni` taken on partition `cpt`
    pub(crate) fn ni_decref(&self, ni: &Arc<Ni>, cpt: usize) {
        let _part = self.net.lock(cpt);
        if ni.refs.put(cpt) {
            let mut shared = self.net.lock_default();
            if ni.refs.demote(&mut shared.ni) {
                assert!(
                    !shared.ni.nis.iter().any(|n| Arc::ptr_eq(n, ni)),
                    "interface {} released while still listed",
                    ni.nid
                );
                shared.ni.zombies.push_back(ni.clone());
                self.zombie_cond.notify_all();
            }
        }
    }

    fn ni_lookup(&self, pick: impl Fn(&NiRegistry) -> Option<Arc<Ni>>) -> Option<NiRef<'_>> {
        let cpt = self.cpts.current();
        let _part = self.net.lock(cpt);
        let mut shared = self.net.lock_default();
        let ni = pick(&shared.ni)?;
        shared.ni.addref_locked(&ni, cpt);
        Some(NiRef {
            state: self,
            ni,
            cpt,
        })
    }

    /// The interface on network `net`, referenced
    pub fn net2ni(&self, net: NetId) -> Option<NiRef<'_>> {
        self.ni_lookup(|reg| reg.find_net(net).cloned())
    }

    /// The interface with nid `nid`, referenced
    pub fn nid2ni(&self, nid: Nid) -> Option<NiRef<'_>> {
        self.ni_lookup(|reg| reg.find_nid(nid).cloned())
    }

    /// The loopback interface, referenced
    pub fn loni(&self) -> Option<NiRef<'_>> {
        self.ni_lookup(|reg| reg.loni.clone())
    }

    /// Whether `nid` is one of ours
    pub fn is_local_nid(&self, nid: Nid) -> bool {
        self.net.lock_default().ni.find_nid(nid).is_some()
    }

    /// Whether we have an interface on `net`
    pub fn is_local_net(&self, net: NetId) -> bool {
        self.net.lock_default().ni.find_net(net).is_some()
    }

    /// Number of interfaces up
    pub fn ni_count(&self) -> usize {
        self.net.lock_default().ni.len()
    }

    /// The process id of our `index`-th interface
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] past the last interface.
    pub fn get_id(&self, index: usize) -> Result<ProcessId, LNetError> {
        self.net
            .lock_default()
            .ni
            .iter()
            .nth(index)
            .map(|ni| ProcessId::new(ni.nid, self.pid))
            .ok_or(LNetError::NotFound)
    }
}
