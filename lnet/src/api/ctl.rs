// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Management commands

use super::LNet;
use crate::errors::LNetError;
use crate::nid::{NetId, Nid, ProcessId};
use crate::ping::PingResult;
use crate::route::RouteInfo;
use std::time::Instant;
use tracing::{debug, warn};

/// A management command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LNetCtl {
    /// The process id of the `index`-th interface
    GetNi(usize),
    /// Simulate failures of messages to and from `nid`
    FailNid { nid: Nid, threshold: u32 },
    AddRoute {
        net: NetId,
        hops: u32,
        gateway: Nid,
        priority: u32,
    },
    /// Remove routes; `None` matches anything
    DelRoute {
        net: Option<NetId>,
        gateway: Option<Nid>,
    },
    GetRoute(usize),
    /// News about a gateway
    NotifyRouter {
        gateway: Nid,
        alive: bool,
        when: Instant,
    },
    /// Corrupt the next connection request, see [`crate::acceptor`]
    TestProtoCompat(u32),
    Ping {
        target: ProcessId,
        timeout_ms: i32,
        max_ids: usize,
    },
    DebugPeer(Nid),
    /// A command for the driver of the interface on `net`
    Driver { net: NetId, cmd: u32, arg: u64 },
}

/// The answer to a management command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlReply {
    Done,
    Id(ProcessId),
    Route(RouteInfo),
    Ping(PingResult),
    Peer(String),
    Driver(u64),
}

impl LNet {
    /// Run a management command
    ///
    /// # Errors
    ///
    /// [`LNetError::NetworkDown`] if the network is not up, or the error of the
    /// command.
    pub fn ctl(&self, cmd: LNetCtl) -> Result<CtlReply, LNetError> {
        let state = self.net()?;
        debug!("ctl {cmd:?}");
        match cmd {
            LNetCtl::GetNi(index) => state.get_id(index).map(CtlReply::Id),
            LNetCtl::FailNid { nid, threshold } => {
                state.fail_nid(nid, threshold);
                Ok(CtlReply::Done)
            }
            LNetCtl::AddRoute {
                net,
                hops,
                gateway,
                priority,
            } => {
                state.add_route(net, hops, gateway, priority)?;
                if let Err(e) = state.check_routes() {
                    warn!("route to {net} via {gateway} conflicts with the table: {e}");
                    if let Err(del) = state.del_route(Some(net), Some(gateway)) {
                        warn!("cannot take it out again: {del}");
                    }
                    return Err(e);
                }
                Ok(CtlReply::Done)
            }
            LNetCtl::DelRoute { net, gateway } => state.del_route(net, gateway).map(|()| CtlReply::Done),
            LNetCtl::GetRoute(index) => state.get_route(index).map(CtlReply::Route),
            LNetCtl::NotifyRouter {
                gateway,
                alive,
                when,
            } => state
                .notify_router(gateway, alive, when)
                .map(|()| CtlReply::Done),
            LNetCtl::TestProtoCompat(flags) => {
                state.test_proto_compat(flags);
                Ok(CtlReply::Done)
            }
            LNetCtl::Ping {
                target,
                timeout_ms,
                max_ids,
            } => state.ping(target, timeout_ms, max_ids).map(CtlReply::Ping),
            LNetCtl::DebugPeer(nid) => state.debug_peer(nid).map(CtlReply::Peer),
            LNetCtl::Driver { net, cmd, arg } => {
                let ni = state
                    .net2ni(net)
                    .ok_or(LNetError::InvalidArgument("no interface on that network"))?;
                ni.lnd.ctl(&ni, cmd, arg).map(CtlReply::Driver)
            }
        }
    }
}
