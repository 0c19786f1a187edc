// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The state of an LNet instance while the network is up.
//!
//! State is split in two lock domains, each sharded per CPU partition:
//!
//! * [`NetState::net`]: interfaces, peers, counters, routes and router pools;
//! * [`NetState::res`]: memory descriptors, match entries, match tables and event
//!   queues.
//!
//! The two domains are never nested: no code path takes a lock of one domain while
//! holding a lock of the other. Within the object domain, a partition lock may be
//! followed by a portal lock, then by the default lock.

use crate::acceptor::Acceptor;
use crate::config::LNetConfig;
use crate::counters::Counters;
use crate::cpt::CptTable;
use crate::eq::EqObj;
use crate::errors::LNetError;
use crate::handle::{Cookie, CookieType, interface_cookie};
use crate::lnd::LndRegistry;
use crate::md::MdObj;
use crate::me::MeObj;
use crate::ni::NiRegistry;
use crate::nid::Pid;
use crate::peer::PeerTable;
use crate::ping::PingTarget;
use crate::portal::{MAX_PORTALS, MatchTable, Portal};
use crate::res::ResContainer;
use crate::route::RouteTable;
use crate::router::{RouterChecker, RouterPools};
use crate::transfer::FailRule;
use ahash::RandomState;
use concurrency::PercptLock;
use concurrency::sync::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tracing::{debug, error};

tracectl::trace_target!("net", tracectl::LevelFilter::INFO, &["lnet"]);

/// Network state of one partition
#[derive(Default)]
pub struct NetPartition {
    pub(crate) peers: PeerTable,
    pub(crate) counters: Counters,
    /// Present only when this node forwards messages
    pub(crate) rtrpools: Option<RouterPools>,
}

impl AsRef<Counters> for NetPartition {
    fn as_ref(&self) -> &Counters {
        &self.counters
    }
}

impl AsMut<Counters> for NetPartition {
    fn as_mut(&mut self) -> &mut Counters {
        &mut self.counters
    }
}

/// Network state shared by all partitions, behind the default network lock
#[derive(Default)]
pub struct NetShared {
    pub(crate) ni: NiRegistry,
    pub(crate) routes: RouteTable,
    pub(crate) fail: Vec<FailRule>,
}

/// Objects owned by one partition
pub struct ResPartition {
    pub(crate) mds: ResContainer<MdObj>,
    /// Unlinked MDs waiting for their pending operations, by their former cookie
    pub(crate) md_zombies: HashMap<Cookie, MdObj, RandomState>,
    pub(crate) mes: ResContainer<MeObj>,
    /// One match table per portal
    pub(crate) mtables: Vec<MatchTable>,
}

impl ResPartition {
    fn new(cpt: usize, cpt_bits: u32) -> Self {
        Self {
            mds: ResContainer::new(CookieType::Md, cpt, cpt_bits),
            md_zombies: HashMap::with_hasher(RandomState::with_seed(0)),
            mes: ResContainer::new(CookieType::Me, cpt, cpt_bits),
            mtables: (0..MAX_PORTALS).map(|_| MatchTable::default()).collect(),
        }
    }

    /// A live or unlinked-but-busy MD
    pub(crate) fn md_mut(&mut self, cookie: Cookie) -> Option<&mut MdObj> {
        if let Some(md) = self.mds.get_mut(cookie) {
            return Some(md);
        }
        self.md_zombies.get_mut(&cookie)
    }
}

/// Objects shared by all partitions, behind the default object lock
pub struct ResShared {
    pub(crate) eqs: ResContainer<EqObj>,
}

/// State of an LNet instance with the network up
pub struct NetState {
    pub(crate) config: LNetConfig,
    pub(crate) cpts: CptTable,
    pub(crate) pid: Pid,
    pub(crate) interface_cookie: u64,
    pub(crate) lnds: Arc<LndRegistry>,
    /// Time base of coarse timestamps
    pub(crate) clock: Instant,

    /// Network domain
    pub net: PercptLock<NetPartition, NetShared>,
    /// Signalled when an interface becomes a zombie; pairs with the default net lock
    pub(crate) zombie_cond: Condvar,

    /// Object domain
    pub res: PercptLock<ResPartition, ResShared>,
    /// Signalled when an event is queued; pairs with the default object lock
    pub(crate) eq_cond: Condvar,
    pub(crate) portals: Box<[Portal]>,

    pub(crate) routing: AtomicBool,
    /// Whether some interface is bound to partitions
    pub(crate) has_affinity: AtomicBool,
    /// Whether failure simulation rules exist
    pub(crate) has_fail_rules: AtomicBool,
    /// Single-shot protocol compatibility test flags
    pub(crate) proto_compat: AtomicU32,

    pub(crate) acceptor: Mutex<Option<Acceptor>>,
    pub(crate) router_checker: Mutex<Option<RouterChecker>>,
    pub(crate) ping_target: Mutex<Option<PingTarget>>,
}

impl NetState {
    /// Set up partitions, portals and object tables, in that order
    pub(crate) fn prepare(
        config: LNetConfig,
        cpts: CptTable,
        pid: Pid,
        lnds: Arc<LndRegistry>,
    ) -> Self {
        let ncpts = cpts.count();
        let bits = cpts.bits();
        let portals = (0..MAX_PORTALS).map(|index| Portal::new(index, ncpts)).collect();
        let state = Self {
            interface_cookie: interface_cookie(),
            net: PercptLock::new(ncpts, |_| NetPartition::default(), NetShared::default()),
            zombie_cond: Condvar::new(),
            portals,
            res: PercptLock::new(
                ncpts,
                |cpt| ResPartition::new(cpt, bits),
                ResShared {
                    // event queues are not partitioned
                    eqs: ResContainer::new(CookieType::Eq, 0, bits),
                },
            ),
            eq_cond: Condvar::new(),
            routing: AtomicBool::new(false),
            has_affinity: AtomicBool::new(false),
            has_fail_rules: AtomicBool::new(false),
            proto_compat: AtomicU32::new(0),
            acceptor: Mutex::new(None),
            router_checker: Mutex::new(None),
            ping_target: Mutex::new(None),
            clock: Instant::now(),
            config,
            cpts,
            pid,
            lnds,
        };
        debug!(
            "prepared {ncpts} partitions, pid {:#x}, interface cookie {:#x}",
            state.pid, state.interface_cookie
        );
        state
    }

    /// Release object tables and portals, reporting leaked objects
    pub(crate) fn unprepare(&self) {
        let mut all = self.res.lock_all();
        let mut leaked = 0;
        for (cpt, part) in all.parts_mut().enumerate() {
            for (index, table) in part.mtables.iter_mut().enumerate() {
                let active = table.clear();
                if active > 0 {
                    error!("{active} active ME(s) on portal {index} partition {cpt} on exit");
                }
            }
            leaked += part.mes.cleanup("MEs");
            leaked += part.mds.cleanup("MDs");
            if !part.md_zombies.is_empty() {
                error!("{} unlinked MD(s) still busy on exit", part.md_zombies.len());
                leaked += part.md_zombies.len();
                part.md_zombies.clear();
            }
        }
        leaked += all.default_mut().eqs.cleanup("EQs");
        drop(all);
        self.net.for_each(|_, part| part.rtrpools = None);
        if leaked > 0 {
            debug!("released {leaked} leaked object(s)");
        }
    }

    /// The pid presented on the wire
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn cpts(&self) -> &CptTable {
        &self.cpts
    }

    #[must_use]
    pub fn config(&self) -> &LNetConfig {
        &self.config
    }

    #[must_use]
    pub fn interface_cookie(&self) -> u64 {
        self.interface_cookie
    }

    /// Coarse timestamp in seconds, never 0
    pub(crate) fn now_secs(&self) -> u64 {
        self.clock.elapsed().as_secs() + 1
    }

    /// Sum of the message counters of all partitions
    pub fn counters(&self) -> Counters {
        crate::counters::snapshot(&self.net)
    }

    /// Zero the message counters of all partitions
    pub fn reset_counters(&self) {
        crate::counters::reset(&self.net);
    }

    pub(crate) fn portal(&self, index: usize) -> Result<&Portal, LNetError> {
        self.portals
            .get(index)
            .ok_or(LNetError::InvalidArgument("portal index out of range"))
    }

    pub(crate) fn lock_acceptor(&self) -> concurrency::sync::MutexGuard<'_, Option<Acceptor>> {
        self.acceptor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_router_checker(&self) -> concurrency::sync::MutexGuard<'_, Option<RouterChecker>> {
        self.router_checker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lnd::lo::LoLnd;
    use crate::lnd::testing::TestLnd;
    use crate::nid::LndType;

    /// A bare state over `ncpts` partitions, with loopback and a test driver registered
    pub(crate) fn bare_state(ncpts: usize) -> (NetState, Arc<TestLnd>) {
        let lnds = Arc::new(LndRegistry::new());
        lnds.register(Arc::new(LoLnd));
        let test = Arc::new(TestLnd::new(LndType::Sock));
        lnds.register(test.clone());
        let cpts = CptTable::new(ncpts, ncpts).unwrap();
        let state = NetState::prepare(LNetConfig::default(), cpts, 42, lnds);
        (state, test)
    }

    #[test]
    fn prepare_and_unprepare() {
        let (state, _) = bare_state(2);
        assert_eq!(state.net.count(), 2);
        assert_eq!(state.res.count(), 2);
        assert_eq!(state.portals.len(), MAX_PORTALS);
        assert_eq!(state.pid(), 42);
        assert!(state.portal(MAX_PORTALS).is_err());
        state.unprepare();
        assert_eq!(state.counters(), Counters::default());
    }
}
