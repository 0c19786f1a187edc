// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A scriptable driver for tests.

use super::{LNetRx, Lnd, LndCaps, NiSetup};
use crate::errors::LNetError;
use crate::msg::LndMsg;
use crate::ni::Ni;
use crate::nid::{LndType, Nid};
use concurrency::sync::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Instant;

#[derive(Default)]
struct TestState {
    next_addr: u32,
    startups: usize,
    shutdowns: usize,
    fail_startup: bool,
    fail_send: bool,
    deliver: bool,
    sent: Vec<LndMsg>,
    last_heard: HashMap<Nid, Instant>,
    accepted: usize,
}

/// A driver that records what it is asked to do
pub struct TestLnd {
    lnd_type: LndType,
    caps: LndCaps,
    state: Mutex<TestState>,
}

impl TestLnd {
    /// A driver of type `lnd_type` handing out addresses from 10.0.0.1
    #[must_use]
    pub fn new(lnd_type: LndType) -> Self {
        Self {
            lnd_type,
            caps: LndCaps::empty(),
            state: Mutex::new(TestState {
                next_addr: 0x0a00_0001,
                ..TestState::default()
            }),
        }
    }

    #[must_use]
    pub fn with_caps(mut self, caps: LndCaps) -> Self {
        self.caps = caps;
        self
    }

    /// First address handed out to interfaces
    #[must_use]
    pub fn with_addr(self, addr: u32) -> Self {
        self.lock().next_addr = addr;
        self
    }

    fn lock(&self) -> MutexGuard<'_, TestState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make the next startups fail
    pub fn fail_startup(&self, fail: bool) {
        self.lock().fail_startup = fail;
    }

    /// Make sends fail
    pub fn fail_send(&self, fail: bool) {
        self.lock().fail_send = fail;
    }

    /// Hand messages addressed to the sending interface back to LNet
    pub fn deliver_to_self(&self, deliver: bool) {
        self.lock().deliver = deliver;
    }

    /// Answer liveness queries about `peer`
    pub fn heard_from(&self, peer: Nid, when: Option<Instant>) {
        let mut state = self.lock();
        match when {
            Some(when) => state.last_heard.insert(peer, when),
            None => state.last_heard.remove(&peer),
        };
    }

    #[must_use]
    pub fn startups(&self) -> usize {
        self.lock().startups
    }

    #[must_use]
    pub fn shutdowns(&self) -> usize {
        self.lock().shutdowns
    }

    #[must_use]
    pub fn accepted(&self) -> usize {
        self.lock().accepted
    }

    /// Messages sent so far
    #[must_use]
    pub fn sent(&self) -> Vec<LndMsg> {
        self.lock().sent.clone()
    }
}

impl Lnd for TestLnd {
    fn lnd_type(&self) -> LndType {
        self.lnd_type
    }

    fn caps(&self) -> LndCaps {
        self.caps
    }

    fn startup(&self, ni: &mut NiSetup) -> Result<(), LNetError> {
        let mut state = self.lock();
        if state.fail_startup {
            return Err(LNetError::Io);
        }
        state.startups += 1;
        ni.nid = Nid::new(ni.net, state.next_addr);
        state.next_addr += 1;
        ni.peertimeout = Some(180);
        Ok(())
    }

    fn shutdown(&self, _ni: &Ni) {
        self.lock().shutdowns += 1;
    }

    fn send(&self, ni: &Arc<Ni>, msg: LndMsg, rx: &dyn LNetRx) -> Result<(), LNetError> {
        let deliver = {
            let mut state = self.lock();
            if state.fail_send {
                return Err(LNetError::Io);
            }
            state.sent.push(msg.clone());
            state.deliver && msg.peer == ni.nid
        };
        if deliver {
            rx.parse(ni, msg)?;
        }
        Ok(())
    }

    fn ctl(&self, _ni: &Ni, cmd: u32, arg: u64) -> Result<u64, LNetError> {
        if !self.caps.contains(LndCaps::CTL) {
            return Err(LNetError::NotSupported("ctl"));
        }
        Ok(u64::from(cmd) + arg)
    }

    fn query(&self, _ni: &Ni, peer: Nid) -> Option<Instant> {
        self.lock().last_heard.get(&peer).copied()
    }

    fn accept(&self, _ni: &Arc<Ni>, _stream: TcpStream) -> Result<(), LNetError> {
        self.lock().accepted += 1;
        Ok(())
    }
}
