// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Bring-up and teardown of the network.
//!
//! Bring-up goes through the [`Stage`]s in order. A failure tears down every stage
//! reached, in reverse order, so the caller sees the network either fully up or
//! fully down.

use crate::acceptor::Acceptor;
use crate::config::{NetSpec, parse_networks};
use crate::errors::LNetError;
use crate::lnd::{LndCaps, NiSetup};
use crate::net::NetState;
use crate::ni::Ni;
use crate::nid::{LndType, NetId};
use crate::router::RouterChecker;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

tracectl::trace_target!("lifecycle", tracectl::LevelFilter::INFO, &["lnet", "ni"]);

/// How long to wait for zombie interfaces before looking again
const ZOMBIE_WAIT: Duration = Duration::from_secs(1);

/// Bring-up steps, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Stage {
    Prepared,
    NisUp,
    Routes,
    Acceptor,
    PingTarget,
    RouterChecker,
}

impl NetState {
    /// Start the interfaces of the configured networks, loopback first
    ///
    /// # Errors
    ///
    /// Bad network strings, unknown or obsolete drivers and driver startup failures.
    /// Interfaces started so far are left listed, for [`NetState::shutdown_lndnis`].
    pub(crate) fn startup_lndnis(&self) -> Result<(), LNetError> {
        let default_nets = self
            .lnds
            .types()
            .into_iter()
            .filter(|lnd_type| *lnd_type != LndType::Lo)
            .map(|lnd_type| lnd_type.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let networks = self.config.resolve_networks(&default_nets)?;
        let mut specs = parse_networks(&networks)?;
        specs.retain(|spec| spec.net != NetId::LO);
        specs.insert(
            0,
            NetSpec {
                net: NetId::LO,
                interfaces: vec![],
                cpts: None,
            },
        );
        for spec in specs {
            self.startup_lndni(spec)?;
        }
        Ok(())
    }

    fn startup_lndni(&self, spec: NetSpec) -> Result<(), LNetError> {
        let net = spec.net;
        let Some(lnd_type) = net.lnd() else {
            error!("unknown driver type {} for network {net}", net.lnd_raw());
            return Err(LNetError::InvalidArgument("unknown driver type"));
        };
        if lnd_type.is_obsolete() {
            error!("driver {lnd_type} is obsolete, cannot bring up {net}");
            return Err(LNetError::InvalidArgument("obsolete driver"));
        }
        if let Some(cpt) = spec.cpts.iter().flatten().find(|&&cpt| cpt >= self.cpts.count()) {
            error!("partition {cpt} of {net} does not exist");
            return Err(LNetError::InvalidArgument("partition out of range"));
        }
        let Some(lnd) = self.lnds.acquire(lnd_type) else {
            error!("driver {lnd_type} not supported, cannot bring up {net}");
            return Err(LNetError::NotSupported("driver not registered"));
        };

        let mut setup = NiSetup::new(net, spec.interfaces, spec.cpts);
        if let Err(e) = lnd.startup(&mut setup) {
            self.lnds.release(lnd_type);
            error!("error {e} starting up {net}");
            return Err(e);
        }
        let ni = Arc::new(Ni::new(setup, lnd, self.cpts.count()));

        let refused = {
            let _part = self.net.lock(0);
            let mut shared = self.net.lock_default();
            if shared.ni.find_nid(ni.nid).is_some() {
                Some("duplicate interface")
            } else if ni.lnd.caps().contains(LndCaps::WAIT) && shared.ni.eqwait_ni.is_some() {
                Some("a single driver may need waiting")
            } else {
                if ni.lnd.caps().contains(LndCaps::WAIT) {
                    shared.ni.eqwait_ni = Some(ni.clone());
                }
                if lnd_type == LndType::Lo {
                    shared.ni.loni = Some(ni.clone());
                }
                if ni.cpts.is_some() {
                    self.has_affinity.store(true, Ordering::Release);
                }
                shared.ni.insert(ni.clone());
                None
            }
        };
        if let Some(why) = refused {
            error!("cannot add interface {}: {why}", ni.nid);
            ni.lnd.shutdown(&ni);
            self.lnds.release(lnd_type);
            return Err(LNetError::InvalidArgument(why));
        }
        info!("added interface {ni}");
        Ok(())
    }

    /// Shut every interface down, waiting until nothing references them
    pub(crate) fn shutdown_lndnis(&self) {
        self.net.lock_default().ni.shutdown = true;

        let unlinked = {
            let mut shared = self.net.lock_default();
            shared.ni.cpt_nis.clear();
            shared.ni.eqwait_ni = None;
            shared.ni.loni = None;
            let nis = std::mem::take(&mut shared.ni.nis);
            shared.ni.nzombie += nis.len();
            nis
        };
        debug!("unlinked {} interface(s)", unlinked.len());
        // drop the references of the list itself
        for ni in &unlinked {
            self.ni_decref(ni, 0);
        }
        drop(unlinked);
        // delayed PUTs go once no interface is reachable anymore
        for ptl in self.portals.iter() {
            if let Err(e) = self.clear_lazy_portal(ptl.index()) {
                warn!("cannot clear portal {}: {e}", ptl.index());
            }
        }
        self.clear_peer_table();
        self.drain_zombies();
        self.has_affinity.store(false, Ordering::Release);
    }

    /// Hand zombie interfaces to their drivers until none is left
    fn drain_zombies(&self) {
        let mut waits: u32 = 2;
        let mut shared = self.net.lock_default();
        while shared.ni.nzombie > 0 {
            let Some(ni) = shared.ni.zombies.pop_front() else {
                waits = waits.wrapping_add(1);
                if waits & waits.wrapping_neg() == waits {
                    warn!("waiting for {} zombie interface(s)", shared.ni.nzombie);
                }
                shared = self
                    .zombie_cond
                    .wait_timeout(shared, ZOMBIE_WAIT)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            };
            drop(shared);
            let lnd_type = ni.lnd.lnd_type();
            ni.lnd.shutdown(&ni);
            self.lnds.release(lnd_type);
            info!("removed interface {}", ni.nid);
            shared = self.net.lock_default();
            shared.ni.nzombie -= 1;
        }
    }

    /// Bring up everything past [`Stage::Prepared`]; on failure, tear it all down
    ///
    /// # Errors
    ///
    /// The error of the step that failed.
    pub(crate) fn bring_up(self: &Arc<Self>) -> Result<(), LNetError> {
        let mut reached = Stage::Prepared;
        self.bring_up_stages(&mut reached).inspect_err(|e| {
            error!("network bring-up failed at {reached:?}: {e}");
            self.tear_down(reached);
        })
    }

    // Each stage is marked reached before it runs: the teardown of a stage copes
    // with the stage having failed half way.
    fn bring_up_stages(self: &Arc<Self>, reached: &mut Stage) -> Result<(), LNetError> {
        *reached = Stage::NisUp;
        self.startup_lndnis()?;

        *reached = Stage::Routes;
        let router = match &self.config.routes {
            Some(routes) => self.parse_routes(routes)?,
            None => false,
        };
        self.check_routes()?;
        self.rtrpools_alloc(router);

        *reached = Stage::Acceptor;
        let acceptor = Acceptor::start(self)?;
        *self.lock_acceptor() = acceptor;

        *reached = Stage::PingTarget;
        self.ping_target_init()?;

        *reached = Stage::RouterChecker;
        let routed = !self.net.lock_default().routes.is_empty();
        if routed || self.get_routing() {
            let checker = RouterChecker::start(self)?;
            *self.lock_router_checker() = Some(checker);
        }
        Ok(())
    }

    /// Undo the stages up to `reached`, in reverse order
    pub(crate) fn tear_down(&self, reached: Stage) {
        if reached >= Stage::RouterChecker {
            let checker = self.lock_router_checker().take();
            if let Some(checker) = checker {
                checker.finish();
            }
        }
        if reached >= Stage::PingTarget {
            self.ping_target_fini();
        }
        if reached >= Stage::Acceptor {
            let acceptor = self.lock_acceptor().take();
            if let Some(acceptor) = acceptor {
                acceptor.finish();
            }
        }
        if reached >= Stage::Routes {
            self.destroy_routes();
            self.rtrpools_free();
        }
        if reached >= Stage::NisUp {
            self.shutdown_lndnis();
        }
        self.unprepare();
        debug!("network torn down from {reached:?}");
    }
}
