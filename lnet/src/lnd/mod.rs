// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network drivers (LNDs).
//!
//! A driver moves messages for the interfaces ([`Ni`]) started on it. LNet only
//! talks to drivers through the [`Lnd`] trait, and drivers hand incoming messages
//! back through [`LNetRx`].

pub mod lo;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use crate::errors::LNetError;
use crate::msg::LndMsg;
use crate::ni::Ni;
use crate::nid::{LndType, NetId, Nid};
use bitflags::bitflags;
use concurrency::sync::Mutex;
use std::any::Any;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

tracectl::trace_target!("lnd", tracectl::LevelFilter::INFO, &["lnet"]);

bitflags! {
    /// Optional driver callbacks
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LndCaps: u32 {
        /// Takes connections from the acceptor
        const ACCEPT = 1 << 0;
        /// Needs [`Lnd::wait`] to make progress
        const WAIT = 1 << 1;
        /// Answers peer liveness queries
        const QUERY = 1 << 2;
        /// Handles [`Lnd::ctl`] commands
        const CTL = 1 << 3;
    }
}

/// What a driver gets to set up a new interface
pub struct NiSetup {
    /// The network of the interface
    pub net: NetId,
    /// The nid of the interface; drivers set the address part
    pub nid: Nid,
    pub interfaces: Vec<String>,
    pub cpts: Option<Vec<usize>>,
    pub maxtxcredits: u32,
    pub peertxcredits: u32,
    pub peerrtrcredits: u32,
    /// Seconds without news after which a peer is considered dead
    pub peertimeout: Option<u32>,
    /// Driver private state
    pub data: Option<Box<dyn Any + Send + Sync>>,
}

impl NiSetup {
    #[must_use]
    pub fn new(net: NetId, interfaces: Vec<String>, cpts: Option<Vec<usize>>) -> Self {
        Self {
            net,
            nid: Nid::new(net, 0),
            interfaces,
            cpts,
            maxtxcredits: 0,
            peertxcredits: 0,
            peerrtrcredits: 0,
            peertimeout: None,
            data: None,
        }
    }
}

/// Receive side of LNet, called by drivers
pub trait LNetRx: Send + Sync {
    /// Deliver a message that arrived on `ni`.
    ///
    /// # Errors
    ///
    /// Fails on messages that cannot be handled at all; messages that are merely
    /// dropped are not errors.
    fn parse(&self, ni: &Arc<Ni>, msg: LndMsg) -> Result<(), LNetError>;

    /// Report news about the liveness of `peer`
    fn notify(&self, ni: &Ni, peer: Nid, alive: bool, when: Instant);
}

/// A network driver
pub trait Lnd: Send + Sync {
    fn lnd_type(&self) -> LndType;

    /// Optional callbacks this driver implements
    fn caps(&self) -> LndCaps {
        LndCaps::empty()
    }

    /// Bring up an interface. The driver sets the address of `ni.nid`.
    ///
    /// # Errors
    ///
    /// Any error aborts the bring-up of the network.
    fn startup(&self, ni: &mut NiSetup) -> Result<(), LNetError>;

    /// Tear down an interface. May block.
    fn shutdown(&self, ni: &Ni);

    /// Send a message. Incoming messages this causes, if any, are delivered to `rx`.
    ///
    /// # Errors
    ///
    /// The message could not be handed to the network.
    fn send(&self, ni: &Arc<Ni>, msg: LndMsg, rx: &dyn LNetRx) -> Result<(), LNetError>;

    /// The payload of a received message has been consumed
    ///
    /// # Errors
    ///
    /// Driver specific.
    fn recv(&self, _ni: &Ni, _msg: &LndMsg) -> Result<(), LNetError> {
        Ok(())
    }

    /// Driver specific control command
    ///
    /// # Errors
    ///
    /// Driver specific, not supported by default.
    fn ctl(&self, _ni: &Ni, _cmd: u32, _arg: u64) -> Result<u64, LNetError> {
        Err(LNetError::NotSupported("ctl"))
    }

    /// When `peer` was last heard of
    fn query(&self, _ni: &Ni, _peer: Nid) -> Option<Instant> {
        None
    }

    /// Take over a connection handed in by the acceptor
    ///
    /// # Errors
    ///
    /// The connection is refused.
    fn accept(&self, _ni: &Arc<Ni>, _stream: TcpStream) -> Result<(), LNetError> {
        Err(LNetError::NotSupported("accept"))
    }

    /// Make progress for up to `timeout`; returns whether anything happened
    fn wait(&self, _ni: &Ni, _timeout: Duration) -> bool {
        false
    }
}

struct Registered {
    lnd: Arc<dyn Lnd>,
    refcount: usize,
}

/// The registered drivers, by type
#[derive(Default)]
pub struct LndRegistry {
    lnds: Mutex<Vec<Registered>>,
}

impl LndRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> concurrency::sync::MutexGuard<'_, Vec<Registered>> {
        self.lnds.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register a driver.
    ///
    /// # Panics
    ///
    /// Panics if a driver of the same type is registered.
    pub fn register(&self, lnd: Arc<dyn Lnd>) {
        let lnd_type = lnd.lnd_type();
        let mut lnds = self.lock();
        assert!(
            !lnds.iter().any(|r| r.lnd.lnd_type() == lnd_type),
            "driver {lnd_type} registered twice"
        );
        lnds.push(Registered { lnd, refcount: 0 });
        info!("registered driver {lnd_type}");
    }

    /// Unregister a driver.
    ///
    /// # Panics
    ///
    /// Panics if the driver is not registered or if interfaces still use it.
    pub fn unregister(&self, lnd_type: LndType) {
        let mut lnds = self.lock();
        let pos = lnds
            .iter()
            .position(|r| r.lnd.lnd_type() == lnd_type)
            .unwrap_or_else(|| panic!("driver {lnd_type} is not registered"));
        assert_eq!(lnds[pos].refcount, 0, "driver {lnd_type} still in use");
        lnds.remove(pos);
        debug!("unregistered driver {lnd_type}");
    }

    /// Unregister every driver.
    ///
    /// # Panics
    ///
    /// Panics if any driver is still in use.
    pub fn unregister_all(&self) {
        for lnd_type in self.types() {
            self.unregister(lnd_type);
        }
    }

    #[must_use]
    pub fn find(&self, lnd_type: LndType) -> Option<Arc<dyn Lnd>> {
        self.lock()
            .iter()
            .find(|r| r.lnd.lnd_type() == lnd_type)
            .map(|r| r.lnd.clone())
    }

    /// Find a driver and count one more interface on it
    pub(crate) fn acquire(&self, lnd_type: LndType) -> Option<Arc<dyn Lnd>> {
        let mut lnds = self.lock();
        let reg = lnds.iter_mut().find(|r| r.lnd.lnd_type() == lnd_type)?;
        reg.refcount += 1;
        Some(reg.lnd.clone())
    }

    /// Count one interface less on a driver
    pub(crate) fn release(&self, lnd_type: LndType) {
        let mut lnds = self.lock();
        if let Some(reg) = lnds.iter_mut().find(|r| r.lnd.lnd_type() == lnd_type) {
            assert!(reg.refcount > 0, "driver {lnd_type} refcount underflow");
            reg.refcount -= 1;
        }
    }

    /// Interfaces started on a driver
    #[must_use]
    pub fn refcount(&self, lnd_type: LndType) -> usize {
        self.lock()
            .iter()
            .find(|r| r.lnd.lnd_type() == lnd_type)
            .map_or(0, |r| r.refcount)
    }

    /// Registered driver types, in registration order
    #[must_use]
    pub fn types(&self) -> Vec<LndType> {
        self.lock().iter().map(|r| r.lnd.lnd_type()).collect()
    }
}
