// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The LNet entry point.
//!
//! An [`LNet`] is created by [`LNet::library_init`] and destroyed by
//! [`LNet::library_fini`]. In between, the network is brought up by the first
//! [`LNet::network_up`] and torn down by the matching last [`LNet::network_down`].
//! While the network is up, [`LNet::net`] gives access to the running [`NetState`].

pub mod ctl;
pub(crate) mod lifecycle;

use crate::acceptor::ConnReq;
use crate::config::LNetConfig;
use crate::counters::Counters;
use crate::cpt::CptTable;
use crate::errors::{ConfigError, LNetError};
use crate::handle::{Handle, WireHandle};
use crate::lnd::lo::LoLnd;
use crate::lnd::{Lnd, LndRegistry};
use crate::net::NetState;
use crate::nid::{LndType, Nid, PID_USERFLAG, Pid, ProcessId};
use crate::ping::PingResult;
use crate::route::Distance;
use arc_swap::ArcSwapOption;
use concurrency::sync::{Mutex, MutexGuard};
use lifecycle::Stage;
use nix::unistd::{getpid, geteuid};
use static_assertions::const_assert_eq;
use std::sync::{Arc, PoisonError};
use tracing::{debug, error, info, warn};

tracectl::trace_target!("api", tracectl::LevelFilter::INFO, &["lnet"]);

// wire layouts
const_assert_eq!(ConnReq::LEN, 16);
const_assert_eq!(size_of::<Nid>(), 8);
const_assert_eq!(size_of::<WireHandle>(), 16);

/// An LNet instance
pub struct LNet {
    config: LNetConfig,
    lnds: Arc<LndRegistry>,
    /// Serializes bring-up and teardown. Counts the `network_up` calls not undone yet.
    refcount: Mutex<u32>,
    /// The running network, if up
    state: ArcSwapOption<NetState>,
}

impl LNet {
    /// Initialize the library: apply the log configuration and register the loopback
    /// driver. Other drivers are registered with [`LNet::register_lnd`] before
    /// bringing the network up.
    ///
    /// # Errors
    ///
    /// Fails on a bad log configuration string.
    pub fn library_init(config: LNetConfig) -> Result<Self, LNetError> {
        if let Some(debug) = &config.debug {
            tracectl::get_trace_ctl()
                .setup_from_string(debug)
                .map_err(|e| ConfigError::Debug(e.to_string()))?;
        }
        let lnds = Arc::new(LndRegistry::new());
        lnds.register(Arc::new(LoLnd));
        debug!("library initialized:\n{config}");
        Ok(Self {
            config,
            lnds,
            refcount: Mutex::new(0),
            state: ArcSwapOption::empty(),
        })
    }

    /// Finalize the library, unregistering every driver.
    ///
    /// # Panics
    ///
    /// Panics if the network is still up.
    pub fn library_fini(self) {
        let refcount = *self.lock_refcount();
        assert_eq!(refcount, 0, "library finalized with the network up");
        self.lnds.unregister_all();
        debug!("library finalized");
    }

    fn lock_refcount(&self) -> MutexGuard<'_, u32> {
        self.refcount.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &LNetConfig {
        &self.config
    }

    /// Register a network driver.
    ///
    /// # Panics
    ///
    /// Panics if a driver of the same type is registered already.
    pub fn register_lnd(&self, lnd: Arc<dyn Lnd>) {
        self.lnds.register(lnd);
    }

    /// Unregister a network driver.
    ///
    /// # Panics
    ///
    /// Panics if the driver is unknown or still in use.
    pub fn unregister_lnd(&self, lnd_type: LndType) {
        self.lnds.unregister(lnd_type);
    }

    #[must_use]
    pub fn lnds(&self) -> &LndRegistry {
        &self.lnds
    }

    /// The pid presented on the wire
    fn wire_pid(&self, requested: Pid) -> Result<Pid, LNetError> {
        if self.config.server_mode {
            if !geteuid().is_root() {
                error!("server mode requires root");
                return Err(LNetError::PermissionDenied("server mode requires root"));
            }
            return Ok(requested);
        }
        let pid = getpid().as_raw().unsigned_abs() | PID_USERFLAG;
        if requested != pid {
            debug!("client mode: using pid {pid:#x} instead of {requested:#x}");
        }
        Ok(pid)
    }

    /// Bring the network up, or count one more user if it is up already
    ///
    /// # Errors
    ///
    /// Any failure of the bring-up, after which the network is down.
    pub fn network_up(&self, requested_pid: Pid) -> Result<(), LNetError> {
        let mut refcount = self.lock_refcount();
        if *refcount > 0 {
            *refcount += 1;
            debug!("network up already, {} user(s)", *refcount);
            return Ok(());
        }
        let pid = self.wire_pid(requested_pid)?;
        let cpts = CptTable::detect(self.config.cpu_npartitions, self.config.cpu_pattern.as_deref())?;
        let state = Arc::new(NetState::prepare(
            self.config.clone(),
            cpts,
            pid,
            self.lnds.clone(),
        ));
        // the ping target goes through the network as any user would
        *refcount = 1;
        if let Err(e) = state.bring_up() {
            *refcount = 0;
            return Err(e);
        }
        info!(
            "network up: {} interface(s), pid {pid:#x}, {} partition(s)",
            state.ni_count(),
            state.cpts().count()
        );
        self.state.store(Some(state));
        Ok(())
    }

    /// Drop one user of the network, tearing it down with the last one
    ///
    /// # Errors
    ///
    /// [`LNetError::NetworkDown`] if the network is not up.
    pub fn network_down(&self) -> Result<(), LNetError> {
        let mut refcount = self.lock_refcount();
        match *refcount {
            0 => {
                warn!("network down but not up");
                return Err(LNetError::NetworkDown);
            }
            1 => {}
            _ => {
                *refcount -= 1;
                debug!("network still has {} user(s)", *refcount);
                return Ok(());
            }
        }
        let Some(state) = self.state.load_full() else {
            panic!("network up without a state");
        };
        state.tear_down(Stage::RouterChecker);
        self.state.store(None);
        *refcount = 0;
        info!("network down");
        Ok(())
    }

    /// Number of `network_up` calls not undone yet
    #[must_use]
    pub fn refcount(&self) -> u32 {
        *self.lock_refcount()
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.state.load().is_some()
    }

    /// The running network
    ///
    /// # Errors
    ///
    /// [`LNetError::NetworkDown`] if the network is not up.
    pub fn net(&self) -> Result<Arc<NetState>, LNetError> {
        self.state.load_full().ok_or(LNetError::NetworkDown)
    }

    /// The process id of our `index`-th interface
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] past the last interface.
    pub fn get_id(&self, index: usize) -> Result<ProcessId, LNetError> {
        self.net()?.get_id(index)
    }

    /// Number of interfaces up, 0 when the network is down
    #[must_use]
    pub fn ni_count(&self) -> usize {
        self.net().map_or(0, |net| net.ni_count())
    }

    /// Whether this node forwards messages for others
    #[must_use]
    pub fn get_routing(&self) -> bool {
        self.net().is_ok_and(|net| net.get_routing())
    }

    /// Start or stop forwarding messages for others
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] without router buffers.
    pub fn set_routing(&self, enable: bool) -> Result<(), LNetError> {
        self.net()?.set_routing(enable)
    }

    /// How far `nid` is
    ///
    /// # Errors
    ///
    /// [`LNetError::HostUnreachable`] if it cannot be reached.
    pub fn dist(&self, nid: Nid) -> Result<Distance, LNetError> {
        self.net()?.dist(nid)
    }

    /// Ping `target`
    ///
    /// # Errors
    ///
    /// See [`NetState::ping`].
    pub fn ping(&self, target: ProcessId, timeout_ms: i32, max_ids: usize) -> Result<PingResult, LNetError> {
        self.net()?.ping(target, timeout_ms, max_ids)
    }

    /// Message counters, zero when the network is down
    #[must_use]
    pub fn counters(&self) -> Counters {
        self.net().map(|net| net.counters()).unwrap_or_default()
    }

    /// Format a handle for display
    #[must_use]
    pub fn snprint_handle<T>(handle: &Handle<T>) -> String {
        crate::handle::snprint_handle(handle)
    }
}
