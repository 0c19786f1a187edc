// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Routes to remote networks, through gateways on local networks.

use crate::config::routes::{MAX_HOPS, parse_route_specs};
use crate::errors::LNetError;
use crate::net::NetState;
use crate::nid::{LndType, NetId, Nid};
use ordermap::OrderMap;
use std::time::Instant;
use tracing::{debug, error, info};

tracectl::trace_target!("route", tracectl::LevelFilter::INFO, &["lnet"]);

/// A route to a remote network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub net: NetId,
    pub gateway: Nid,
    pub hops: u32,
    /// Lower is preferred among routes of equal hop count
    pub priority: u32,
}

/// A gateway some routes go through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub nid: Nid,
    pub alive: bool,
    /// Last news about the gateway
    pub last_alive: Option<Instant>,
    /// When the router checker last looked at it
    pub last_check: Option<Instant>,
    /// Routes through this gateway
    pub routes: usize,
    /// Interfaces of the gateway and their status, from its last ping reply
    pub nis: Vec<(Nid, u32)>,
}

impl Gateway {
    fn new(nid: Nid) -> Self {
        Self {
            nid,
            // assumed alive until proven otherwise
            alive: true,
            last_alive: None,
            last_check: None,
            routes: 0,
            nis: vec![],
        }
    }
}

/// A route as reported to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub route: Route,
    pub alive: bool,
}

/// The routing table. Lives behind the default network lock.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    gateways: OrderMap<Nid, Gateway>,
    /// Bumped on every change
    version: u64,
}

impl RouteTable {
    /// Add a route; false if the same route through the same gateway exists
    pub fn add(&mut self, route: Route) -> bool {
        if self
            .routes
            .iter()
            .any(|r| r.net == route.net && r.gateway == route.gateway)
        {
            return false;
        }
        self.gateways
            .entry(route.gateway)
            .or_insert_with(|| Gateway::new(route.gateway))
            .routes += 1;
        self.routes.push(route);
        self.version += 1;
        true
    }

    /// Remove the routes to `net` through `gateway`, any of them if `None`.
    /// Returns how many went.
    pub fn remove(&mut self, net: Option<NetId>, gateway: Option<Nid>) -> usize {
        let before = self.routes.len();
        let gateways = &mut self.gateways;
        self.routes.retain(|r| {
            let hit = net.is_none_or(|net| r.net == net) && gateway.is_none_or(|gw| r.gateway == gw);
            if hit {
                if let Some(gw) = gateways.get_mut(&r.gateway) {
                    gw.routes -= 1;
                }
            }
            !hit
        });
        self.gateways.retain(|_, gw| gw.routes > 0);
        let removed = before - self.routes.len();
        if removed > 0 {
            self.version += 1;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.remove(None, None);
    }

    /// The `index`-th route, and whether its gateway is alive
    #[must_use]
    pub fn get(&self, index: usize) -> Option<RouteInfo> {
        let route = self.routes.get(index)?;
        Some(RouteInfo {
            route: route.clone(),
            alive: self.is_alive(route.gateway),
        })
    }

    fn is_alive(&self, gateway: Nid) -> bool {
        self.gateways.get(&gateway).is_some_and(|gw| gw.alive)
    }

    /// The route to use for `net`: through an alive gateway, fewest hops first,
    /// then lowest priority
    #[must_use]
    pub fn best(&self, net: NetId) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|r| r.net == net && self.is_alive(r.gateway))
            .min_by_key(|r| (r.hops, r.priority))
    }

    /// Fewest hops to `net`, alive or not
    #[must_use]
    pub fn shortest(&self, net: NetId) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|r| r.net == net)
            .min_by_key(|r| r.hops)
    }

    /// Remote networks in the order their first route was added
    pub fn nets(&self) -> impl Iterator<Item = NetId> + '_ {
        let mut seen = vec![];
        self.routes.iter().filter_map(move |r| {
            if seen.contains(&r.net) {
                return None;
            }
            seen.push(r.net);
            Some(r.net)
        })
    }

    /// Record news about `gateway`; older news is ignored. Returns whether the
    /// gateway is known.
    pub fn set_alive(&mut self, gateway: Nid, alive: bool, when: Instant) -> bool {
        let Some(gw) = self.gateways.get_mut(&gateway) else {
            return false;
        };
        if gw.last_alive.is_some_and(|last| last > when) {
            return true;
        }
        if gw.alive != alive {
            info!("gateway {gateway} is {}", if alive { "up" } else { "down" });
            self.version += 1;
        }
        gw.alive = alive;
        gw.last_alive = Some(when);
        true
    }

    pub(crate) fn gateway_mut(&mut self, nid: Nid) -> Option<&mut Gateway> {
        self.gateways.get_mut(&nid)
    }

    pub fn gateways(&self) -> impl Iterator<Item = &Gateway> {
        self.gateways.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Every gateway of a remote network must be on the same local network
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] naming nothing; the offending routes are logged.
    pub fn check(&self) -> Result<(), LNetError> {
        for net in self.nets() {
            let mut via = self.routes.iter().filter(|r| r.net == net);
            let Some(first) = via.next() else {
                continue;
            };
            if let Some(other) = via.find(|r| r.gateway.net() != first.gateway.net()) {
                error!(
                    "routes to {net} via {} and {} not supported",
                    first.gateway, other.gateway
                );
                return Err(LNetError::InvalidArgument("routes through several local networks"));
            }
        }
        Ok(())
    }
}

/// How far a nid is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Distance {
    /// 0 or 1 for local nids, 1 for local networks, hops + 1 beyond
    pub dist: u32,
    /// The local nid messages to that nid come from
    pub src: Nid,
    /// Rank of the network among those we reach, for ordering choices
    pub order: u32,
}

impl NetState {
    /// Add a route to `net` through `gateway`. Routes to local networks and
    /// through unreachable gateways are ignored.
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] on bad arguments, [`LNetError::NetworkDown`]
    /// while shutting down.
    pub fn add_route(&self, net: NetId, hops: u32, gateway: Nid, priority: u32) -> Result<(), LNetError> {
        debug!("add route: net {net} hops {hops} priority {priority} gw {gateway}");
        if gateway.is_any()
            || gateway.net().lnd() == Some(LndType::Lo)
            || net.lnd() == Some(LndType::Lo)
            || gateway.net() == net
            || !(1..=MAX_HOPS).contains(&hops)
        {
            return Err(LNetError::InvalidArgument("bad route"));
        }
        if self.is_local_net(net) {
            return Ok(());
        }
        match self.peer_ni(gateway) {
            Ok(_) => {}
            Err(LNetError::HostUnreachable) => {
                debug!("ignoring route to {net}: gateway {gateway} is not on a local network");
                return Ok(());
            }
            Err(e) => {
                error!("error {e} creating route {net} {hops} {gateway}");
                return Err(e);
            }
        }
        let added = self.net.lock_default().routes.add(Route {
            net,
            gateway,
            hops,
            priority,
        });
        if !added {
            debug!("route to {net} via {gateway} exists");
        }
        Ok(())
    }

    /// Remove routes, to any network and through any gateway when `None`
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] if no route matched.
    pub fn del_route(&self, net: Option<NetId>, gateway: Option<Nid>) -> Result<(), LNetError> {
        let removed = self.net.lock_default().routes.remove(net, gateway);
        debug!("removed {removed} route(s)");
        if removed == 0 {
            return Err(LNetError::NotFound);
        }
        Ok(())
    }

    /// The `index`-th route
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] past the last route.
    pub fn get_route(&self, index: usize) -> Result<RouteInfo, LNetError> {
        self.net
            .lock_default()
            .routes
            .get(index)
            .ok_or(LNetError::NotFound)
    }

    /// Add the routes of a `routes` string. Returns whether one of them names
    /// this node as a gateway, making it a router.
    ///
    /// # Errors
    ///
    /// Fails on malformed strings and on routes that cannot be added.
    pub(crate) fn parse_routes(&self, routes: &str) -> Result<bool, LNetError> {
        let mut router = false;
        for spec in parse_route_specs(routes)? {
            for (gateway, priority) in spec.gateways {
                if self.is_local_nid(gateway) {
                    router = true;
                    continue;
                }
                self.add_route(spec.net, spec.hops, gateway, priority)?;
            }
        }
        Ok(router)
    }

    /// Check the route table
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] if a remote network is reached through
    /// several local networks.
    pub(crate) fn check_routes(&self) -> Result<(), LNetError> {
        self.net.lock_default().routes.check()
    }

    pub(crate) fn destroy_routes(&self) {
        self.net.lock_default().routes.clear();
    }

    /// Report a gateway up or down, as of `when`
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] for news from the future.
    pub fn notify_router(&self, gateway: Nid, alive: bool, when: Instant) -> Result<(), LNetError> {
        self.notify_peer(None, gateway, alive, when)
    }

    /// How far `nid` is, and through which local nid
    ///
    /// # Errors
    ///
    /// [`LNetError::HostUnreachable`] without a local network or route to it.
    pub fn dist(&self, nid: Nid) -> Result<Distance, LNetError> {
        let shared = self.net.lock_default();
        let mut order = 0;
        for ni in shared.ni.iter() {
            if ni.nid == nid {
                let dist = u32::from(!self.config.local_nid_dist_zero);
                return Ok(Distance { dist, src: nid, order });
            }
            if ni.net() == nid.net() {
                return Ok(Distance {
                    dist: 1,
                    src: ni.nid,
                    order,
                });
            }
            order += 1;
        }
        for net in shared.routes.nets() {
            if net == nid.net() {
                let Some(route) = shared.routes.shortest(net) else {
                    break;
                };
                let src = shared
                    .ni
                    .find_net(route.gateway.net())
                    .map_or(route.gateway, |ni| ni.nid);
                return Ok(Distance {
                    dist: route.hops + 1,
                    src,
                    order,
                });
            }
            order += 1;
        }
        Err(LNetError::HostUnreachable)
    }
}
