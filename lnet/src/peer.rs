// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Peers: the nodes we talk to directly, one table per partition.
//!
//! A peer lives on the partition its nid hashes to and holds a reference on its
//! interface on that same partition, so that an interface cannot go away under the
//! peers that use it.

use crate::errors::LNetError;
use crate::lnd::LndCaps;
use crate::net::NetState;
use crate::ni::Ni;
use crate::nid::Nid;
use ahash::RandomState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

tracectl::trace_target!("peer", tracectl::LevelFilter::INFO, &["lnet"]);

/// A peer
#[derive(Debug)]
pub struct Peer {
    pub nid: Nid,
    /// The interface we reach the peer through
    pub ni: Arc<Ni>,
    pub alive: bool,
    /// When the peer was last heard of
    pub last_alive: Option<Instant>,
    /// Send credits, as granted by the interface
    pub txcredits: u32,
    /// Credits for messages forwarded to this peer
    pub rtrcredits: u32,
    pub sent: u64,
    pub received: u64,
}

impl Peer {
    fn new(nid: Nid, ni: Arc<Ni>) -> Self {
        Self {
            nid,
            txcredits: ni.peertxcredits,
            rtrcredits: ni.peerrtrcredits,
            ni,
            alive: true,
            last_alive: None,
            sent: 0,
            received: 0,
        }
    }

    /// Update liveness with news from `when`; older news is ignored
    pub(crate) fn set_alive(&mut self, alive: bool, when: Instant) {
        if self.last_alive.is_some_and(|last| last > when) {
            return;
        }
        if self.alive != alive {
            info!("peer {} is {}", self.nid, if alive { "up" } else { "down" });
        }
        self.alive = alive;
        self.last_alive = Some(when);
    }
}

/// Peers of one partition, by nid
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<Nid, Peer, RandomState>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self {
            peers: HashMap::with_hasher(RandomState::with_seed(0)),
        }
    }
}

impl PeerTable {
    #[must_use]
    pub fn get(&self, nid: Nid) -> Option<&Peer> {
        self.peers.get(&nid)
    }

    pub(crate) fn get_mut(&mut self, nid: Nid) -> Option<&mut Peer> {
        self.peers.get_mut(&nid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    fn drain(&mut self) -> impl Iterator<Item = Peer> + '_ {
        self.peers.drain().map(|(_, peer)| peer)
    }
}

impl NetState {
    /// Find or create the peer `nid`, returning the interface it is reached through.
    /// A new peer takes a reference on that interface.
    ///
    /// # Errors
    ///
    /// [`LNetError::NetworkDown`] while shutting down, [`LNetError::HostUnreachable`]
    /// if no interface is on the peer's network.
    pub(crate) fn peer_ni(&self, nid: Nid) -> Result<Arc<Ni>, LNetError> {
        let cpt = self.cpts.cpt_of_nid(nid);
        let mut part = self.net.lock(cpt);
        let mut shared = self.net.lock_default();
        if shared.ni.shutdown {
            return Err(LNetError::NetworkDown);
        }
        if let Some(peer) = part.peers.get(nid) {
            return Ok(peer.ni.clone());
        }
        let ni = shared
            .ni
            .find_net(nid.net())
            .cloned()
            .ok_or(LNetError::HostUnreachable)?;
        shared.ni.addref_locked(&ni, cpt);
        debug!("new peer {nid} on {} (partition {cpt})", ni.nid);
        part.peers.peers.insert(nid, Peer::new(nid, ni.clone()));
        Ok(ni)
    }

    /// Whether `nid` may be sent to: peers of drivers that track liveness must
    /// have been heard from within the interface's peer timeout
    pub(crate) fn peer_alive(&self, ni: &Ni, nid: Nid) -> bool {
        let Some(timeout) = ni.peertimeout.filter(|&t| t > 0) else {
            return true;
        };
        if !ni.lnd.caps().contains(LndCaps::QUERY) {
            return true;
        }
        let heard = ni.lnd.query(ni, nid);
        let now = Instant::now();
        let cpt = self.cpts.cpt_of_nid(nid);
        let mut part = self.net.lock(cpt);
        let Some(peer) = part.peers.get_mut(nid) else {
            return true;
        };
        if let Some(heard) = heard {
            peer.set_alive(true, heard);
        }
        let deadline = Duration::from_secs(u64::from(timeout));
        let alive = peer
            .last_alive
            .is_some_and(|last| now.saturating_duration_since(last) < deadline);
        if !alive && peer.alive {
            peer.set_alive(false, now);
        }
        alive
    }

    /// Count a message exchanged with `nid`
    pub(crate) fn peer_traffic(&self, nid: Nid, sent: bool) {
        let cpt = self.cpts.cpt_of_nid(nid);
        let mut part = self.net.lock(cpt);
        if let Some(peer) = part.peers.get_mut(nid) {
            if sent {
                peer.sent += 1;
            } else {
                peer.received += 1;
            }
        }
    }

    /// Forget every peer, releasing their interface references
    pub(crate) fn clear_peer_table(&self) {
        let mut all = self.net.lock_all();
        let (parts, shared) = all.split_mut();
        let mut zombies = false;
        let mut count = 0;
        for (cpt, part) in parts.into_iter().enumerate() {
            for peer in part.peers.drain() {
                count += 1;
                zombies |= shared.ni.decref_locked(&peer.ni, cpt);
            }
        }
        drop(all);
        if zombies {
            self.zombie_cond.notify_all();
        }
        debug!("cleared {count} peer(s)");
    }

    /// Record news about the liveness of `nid`, heard through `ni` if known
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] for news from the future, or for a peer not on
    /// the network of `ni`; [`LNetError::NetworkDown`] while shutting down.
    pub fn notify_peer(&self, ni: Option<&Ni>, nid: Nid, alive: bool, when: Instant) -> Result<(), LNetError> {
        if when > Instant::now() {
            return Err(LNetError::InvalidArgument("liveness news from the future"));
        }
        if ni.is_some_and(|ni| ni.net() != nid.net()) {
            return Err(LNetError::InvalidArgument("peer not on the notifying network"));
        }
        let cpt = self.cpts.cpt_of_nid(nid);
        let mut part = self.net.lock(cpt);
        let mut shared = self.net.lock_default();
        if shared.ni.shutdown {
            return Err(LNetError::NetworkDown);
        }
        let Some(peer) = part.peers.get_mut(nid) else {
            debug!("{nid} not found");
            return Ok(());
        };
        // drivers reporting a death may not know when the peer was last seen
        let when = match (ni, peer.last_alive) {
            (Some(_), Some(last)) if !alive && when < last => last,
            _ => when,
        };
        peer.set_alive(alive, when);
        shared.routes.set_alive(nid, alive, when);
        Ok(())
    }

    /// Describe peer `nid`
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] if there is no such peer.
    pub fn debug_peer(&self, nid: Nid) -> Result<String, LNetError> {
        let cpt = self.cpts.cpt_of_nid(nid);
        let part = self.net.lock(cpt);
        let peer = part.peers.get(nid).ok_or(LNetError::NotFound)?;
        let text = peer.to_string();
        info!("{text}");
        Ok(text)
    }

    /// Number of peers over all partitions
    pub fn peer_count_total(&self) -> usize {
        let mut count = 0;
        self.net.for_each(|_, part| count += part.peers.len());
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lnd::NiSetup;
    use crate::lnd::testing::TestLnd;
    use crate::net::tests::bare_state;
    use crate::nid::{LndType, NetId};

    fn add_ni(state: &NetState, lnd: Arc<TestLnd>) -> Arc<Ni> {
        let mut setup = NiSetup::new(NetId::new(LndType::Sock, 0), vec![], None);
        setup.nid = Nid::new(setup.net, 1);
        setup.peertxcredits = 8;
        let ni = Arc::new(Ni::new(setup, lnd, state.cpts.count()));
        state.net.lock_default().ni.insert(ni.clone());
        ni
    }

    #[test]
    fn peers_hold_interface_references() {
        let (state, lnd) = bare_state(2);
        let ni = add_ni(&state, lnd);
        let net = ni.net();
        let peers: Vec<_> = (10..20).map(|addr| Nid::new(net, addr)).collect();
        for &nid in &peers {
            let via = state.peer_ni(nid).unwrap();
            assert!(Arc::ptr_eq(&via, &ni));
        }
        // again: no new reference
        state.peer_ni(peers[0]).unwrap();
        assert_eq!(state.peer_count_total(), peers.len());
        let refs: u32 = (0..2).map(|cpt| ni.refs().on(cpt)).sum();
        assert_eq!(refs as usize, peers.len() + 1);
        assert_eq!(state.debug_peer(peers[3]).map(|s| s.contains("txcr 8")), Ok(true));

        // unlist, then clear: only the peers held references
        state.net.lock_default().ni.nis.clear();
        state.clear_peer_table();
        assert_eq!(state.peer_count_total(), 0);
        assert_eq!(ni.refs().big(), 1);
        assert_eq!(state.debug_peer(peers[3]), Err(LNetError::NotFound));
    }

    #[test]
    fn unreachable_and_shutdown() {
        let (state, lnd) = bare_state(1);
        add_ni(&state, lnd);
        let far = Nid::new(NetId::new(LndType::O2ib, 3), 1);
        assert!(matches!(state.peer_ni(far), Err(LNetError::HostUnreachable)));
        state.net.lock_default().ni.shutdown = true;
        let near = Nid::new(NetId::new(LndType::Sock, 0), 2);
        assert!(matches!(state.peer_ni(near), Err(LNetError::NetworkDown)));
    }

    #[test]
    fn liveness_news() {
        let (state, lnd) = bare_state(1);
        let ni = add_ni(&state, lnd);
        let nid = Nid::new(ni.net(), 7);
        state.peer_ni(nid).unwrap();
        let now = Instant::now();
        assert!(matches!(
            state.notify_peer(Some(&ni), nid, true, now + Duration::from_secs(60)),
            Err(LNetError::InvalidArgument(_))
        ));
        state.notify_peer(Some(&ni), nid, false, now).unwrap();
        assert!(!state.net.lock(0).peers.get(nid).unwrap().alive);
        // stale news does not override
        let earlier = now.checked_sub(Duration::from_secs(1)).unwrap_or(now);
        if earlier < now {
            state.notify_peer(None, nid, true, earlier).unwrap();
            assert!(!state.net.lock(0).peers.get(nid).unwrap().alive);
        }
    }

    #[test]
    fn queried_liveness() {
        let (state, _) = bare_state(1);
        let lnd = Arc::new(TestLnd::new(LndType::Sock).with_caps(LndCaps::QUERY));
        let mut setup = NiSetup::new(NetId::new(LndType::Sock, 0), vec![], None);
        setup.peertimeout = Some(10);
        let ni = Arc::new(Ni::new(setup, lnd.clone(), 1));
        state.net.lock_default().ni.insert(ni.clone());
        let nid = Nid::new(ni.net(), 9);
        state.peer_ni(nid).unwrap();
        assert!(!state.peer_alive(&ni, nid));
        lnd.heard_from(nid, Some(Instant::now()));
        assert!(state.peer_alive(&ni, nid));
    }
}
