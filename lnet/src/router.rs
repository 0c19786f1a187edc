// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Router side: forwarding buffer pools and the router checker.
//!
//! A node forwards messages only when it has router buffer pools, allocated at
//! startup if a route names it as a gateway or forwarding is forced on. The router
//! checker is a background thread that keeps track of the gateways our routes go
//! through, and of the status of our own interfaces when we forward.

use crate::errors::LNetError;
use crate::lnd::LndCaps;
use crate::net::NetState;
use crate::ni::NI_STATUS_DOWN;
use crate::nid::{LUSTRE_SRV_LNET_PID, LndType, Nid, ProcessId};
use concurrency::sync::{Condvar, Mutex};
use std::sync::{Arc, PoisonError, Weak};
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

tracectl::trace_target!("router", tracectl::LevelFilter::INFO, &["lnet"]);

/// Largest payload of a message
pub const LNET_MTU: usize = 1 << 20;
const PAGE_SIZE: usize = 4096;

/// Default and smallest per partition buffer counts
const NRB_TINY_MIN: u32 = 512;
const NRB_TINY: u32 = NRB_TINY_MIN * 4;
const NRB_SMALL_MIN: u32 = 4096;
const NRB_SMALL: u32 = NRB_SMALL_MIN * 4;
const NRB_SMALL_PAGES: usize = 1;
const NRB_LARGE_MIN: u32 = 256;
const NRB_LARGE: u32 = NRB_LARGE_MIN * 4;
const NRB_LARGE_PAGES: usize = LNET_MTU.div_ceil(PAGE_SIZE);

/// Gateway interfaces asked for in router pings
const MAX_RTR_NIS: usize = 16;

/// Period of the router checker
const CHECKER_TICK: Duration = Duration::from_secs(1);

/// Buffers of one size for forwarded messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterPool {
    /// Pages per buffer; 0 for header-only messages
    pub npages: usize,
    pub nbuffers: u32,
    /// Buffers free
    pub credits: u32,
    /// Fewest buffers ever free
    pub mincredits: u32,
}

impl RouterPool {
    fn new(npages: usize, nbuffers: u32) -> Self {
        Self {
            npages,
            nbuffers,
            credits: nbuffers,
            mincredits: nbuffers,
        }
    }

    /// Largest payload a buffer of this pool holds
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.npages * PAGE_SIZE
    }

    /// Take a buffer, if one is free
    pub(crate) fn take(&mut self) -> bool {
        if self.credits == 0 {
            return false;
        }
        self.credits -= 1;
        self.mincredits = self.mincredits.min(self.credits);
        true
    }

    pub(crate) fn give(&mut self) {
        assert!(self.credits < self.nbuffers, "router buffer returned twice");
        self.credits += 1;
    }
}

/// The router buffer pools of one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterPools {
    pub tiny: RouterPool,
    pub small: RouterPool,
    pub large: RouterPool,
}

/// Buffers per partition: the configured count, or the default, shared out
fn per_cpt(configured: u32, default: u32, min: u32, ncpts: usize) -> u32 {
    let total = if configured > 0 { configured } else { default };
    let ncpts = u32::try_from(ncpts).unwrap_or(u32::MAX).max(1);
    (total / ncpts).max(min)
}

impl RouterPools {
    #[must_use]
    pub fn new(tiny: u32, small: u32, large: u32, ncpts: usize) -> Self {
        Self {
            tiny: RouterPool::new(0, per_cpt(tiny, NRB_TINY, NRB_TINY_MIN, ncpts)),
            small: RouterPool::new(
                NRB_SMALL_PAGES,
                per_cpt(small, NRB_SMALL, NRB_SMALL_MIN, ncpts),
            ),
            large: RouterPool::new(
                NRB_LARGE_PAGES,
                per_cpt(large, NRB_LARGE, NRB_LARGE_MIN, ncpts),
            ),
        }
    }

    /// The pool buffers for a payload of `len` bytes come from
    pub fn pool_for(&mut self, len: usize) -> &mut RouterPool {
        if len == 0 {
            &mut self.tiny
        } else if len <= self.small.capacity() {
            &mut self.small
        } else {
            &mut self.large
        }
    }
}

impl NetState {
    /// Allocate router buffer pools and turn forwarding on, if we are a router
    pub(crate) fn rtrpools_alloc(&self, router: bool) {
        if !router && !self.config.forwarding {
            return;
        }
        let ncpts = self.cpts.count();
        let pools = RouterPools::new(
            self.config.tiny_router_buffers,
            self.config.small_router_buffers,
            self.config.large_router_buffers,
            ncpts,
        );
        info!(
            "forwarding enabled: {} tiny, {} small, {} large buffers per partition",
            pools.tiny.nbuffers, pools.small.nbuffers, pools.large.nbuffers
        );
        self.net.for_each(|_, part| part.rtrpools = Some(pools.clone()));
        self.routing.store(true, Ordering::Release);
    }

    pub(crate) fn rtrpools_free(&self) {
        self.routing.store(false, Ordering::Release);
        self.net.for_each(|_, part| part.rtrpools = None);
    }

    /// Whether this node forwards messages
    pub fn get_routing(&self) -> bool {
        self.routing.load(Ordering::Acquire)
    }

    /// Toggle forwarding; turning it on requires router buffers
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] if this node has no router buffers.
    pub fn set_routing(&self, enable: bool) -> Result<(), LNetError> {
        if enable && self.net.lock(0).rtrpools.is_none() {
            return Err(LNetError::InvalidArgument("no router buffers"));
        }
        self.routing.store(enable, Ordering::Release);
        Ok(())
    }

    /// Take a router buffer on partition `cpt` for a payload of `len` bytes
    pub(crate) fn rtrbuf_take(&self, cpt: usize, len: usize) -> bool {
        let mut part = self.net.lock(cpt);
        part.rtrpools
            .as_mut()
            .is_some_and(|pools| pools.pool_for(len).take())
    }

    pub(crate) fn rtrbuf_give(&self, cpt: usize, len: usize) {
        let mut part = self.net.lock(cpt);
        if let Some(pools) = part.rtrpools.as_mut() {
            pools.pool_for(len).give();
        }
    }

    /// Seconds between checks of a gateway
    fn check_interval(&self, alive: bool) -> Duration {
        Duration::from_secs(if alive {
            self.config.live_router_check_interval
        } else {
            self.config.dead_router_check_interval
        })
    }

    /// Check the gateways due for it: through the driver when it tracks peers,
    /// with a ping otherwise
    pub(crate) fn check_gateways(&self, now: Instant) {
        let due: Vec<_> = {
            let shared = self.net.lock_default();
            shared
                .routes
                .gateways()
                .filter(|gw| {
                    gw.last_check
                        .is_none_or(|last| now.saturating_duration_since(last) >= self.check_interval(gw.alive))
                })
                .filter_map(|gw| Some((gw.nid, shared.ni.find_net(gw.nid.net())?.clone())))
                .collect()
        };
        let timeout = Duration::from_secs(self.config.router_ping_timeout);
        for (gateway, ni) in due {
            let mut nis = None;
            let (alive, when) = if ni.lnd.caps().contains(LndCaps::QUERY) {
                match ni.lnd.query(&ni, gateway) {
                    Some(heard) if now.saturating_duration_since(heard) < timeout => (true, heard),
                    _ => (false, now),
                }
            } else {
                match self.ping_gateway(gateway) {
                    Ok(info) => {
                        nis = Some(info);
                        (true, Instant::now())
                    }
                    Err(e) => {
                        debug!("gateway {gateway} did not answer: {e}");
                        (false, Instant::now())
                    }
                }
            };
            {
                let mut shared = self.net.lock_default();
                if let Some(gw) = shared.routes.gateway_mut(gateway) {
                    gw.last_check = Some(now);
                    if let Some(nis) = nis {
                        gw.nis = nis;
                    }
                }
            }
            if let Err(e) = self.notify_peer(None, gateway, alive, when.min(Instant::now())) {
                debug!("cannot record status of gateway {gateway}: {e}");
            }
        }
    }

    fn ping_gateway(&self, gateway: Nid) -> Result<Vec<(Nid, u32)>, LNetError> {
        let timeout_ms = i32::try_from(self.config.router_ping_timeout.saturating_mul(1000))
            .unwrap_or(i32::MAX);
        let target = ProcessId::new(gateway, LUSTRE_SRV_LNET_PID);
        let (info, _) = self.ping_info(target, timeout_ms, MAX_RTR_NIS)?;
        Ok(info.nis)
    }

    /// Mark down the interfaces that have been silent for too long
    pub(crate) fn update_ni_status(&self, now: u64) {
        let timeout = self.config.router_ping_timeout
            + self
                .config
                .live_router_check_interval
                .max(self.config.dead_router_check_interval);
        let mut changed = false;
        {
            let shared = self.net.lock_default();
            for ni in shared.ni.iter() {
                if ni.net().lnd() == Some(LndType::Lo) || now < ni.last_alive() + timeout {
                    continue;
                }
                if ni.status() != NI_STATUS_DOWN {
                    debug!("interface {} status changed to down after {timeout}s", ni.nid);
                    ni.set_status(NI_STATUS_DOWN);
                    changed = true;
                }
            }
        }
        if changed {
            self.ping_target_refresh();
        }
    }
}

/// The router checker thread
pub struct RouterChecker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl RouterChecker {
    /// Start checking gateways of `state`, until [`RouterChecker::finish`]
    ///
    /// # Errors
    ///
    /// The thread could not be spawned.
    pub(crate) fn start(state: &Arc<NetState>) -> Result<Self, LNetError> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let weak: Weak<NetState> = Arc::downgrade(state);
        let signal = stop.clone();
        let handle = thread::Builder::new()
            .name("router-checker".to_string())
            .spawn(move || checker_loop(&weak, &signal))
            .map_err(|e| {
                error!("failed to spawn router checker: {e}");
                LNetError::NoMemory
            })?;
        debug!("router checker started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it
    pub(crate) fn finish(mut self) {
        {
            let (stopped, cond) = &*self.stop;
            *stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
            cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("router checker panicked");
            }
        }
        debug!("router checker stopped");
    }
}

fn checker_loop(state: &Weak<NetState>, stop: &(Mutex<bool>, Condvar)) {
    let (stopped, cond) = stop;
    loop {
        {
            let guard = stopped.lock().unwrap_or_else(PoisonError::into_inner);
            if *guard {
                return;
            }
            let (guard, _) = cond
                .wait_timeout(guard, CHECKER_TICK)
                .unwrap_or_else(PoisonError::into_inner);
            if *guard {
                return;
            }
        }
        let Some(state) = state.upgrade() else {
            return;
        };
        state.check_gateways(Instant::now());
        if state.get_routing() {
            state.update_ni_status(state.now_secs());
        }
    }
}
