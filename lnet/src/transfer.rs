// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Moving messages: PUT and GET initiation, the receive path drivers call into,
//! forwarding, and simulated failures.
//!
//! Messages for a local nid go through the loopback interface; messages for a
//! network we are on go straight to the peer; anything else goes through the best
//! gateway. No lock is held while a driver sends, since a driver may hand the message
//! straight back through [`LNetRx::parse`].

use crate::counters::Counters;
use crate::errors::LNetError;
use crate::handle::{Cookie, Handle, Md, WireHandle};
use crate::lnd::LNetRx;
use crate::md::{MdBuf, MdOptions};
use crate::msg::{Event, EventKind, Header, LndMsg, MsgBody};
use crate::net::NetState;
use crate::ni::{NI_STATUS_UP, Ni};
use crate::nid::{LndType, NID_ANY, Nid, ProcessId};
use crate::portal::{DelayedPut, MatchInfo, Matched, Verdict};
use crate::router::LNET_MTU;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, trace, warn};

tracectl::trace_target!("transfer", tracectl::LevelFilter::INFO, &["lnet"]);

/// Threshold of a failure rule that never runs out
pub const FAIL_FOREVER: u32 = u32::MAX;

/// A simulated failure rule: messages to and from `nid` are dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailRule {
    /// A peer, or [`NID_ANY`] for every peer
    pub nid: Nid,
    /// Messages left to drop; `None` for no limit
    pub threshold: Option<u32>,
}

/// Whether a PUT asks for an acknowledgment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckReq {
    #[default]
    NoAck,
    Ack,
}

/// Where a message leaves from
struct Hop {
    ni: Arc<Ni>,
    /// The destination itself, or a gateway
    peer: Nid,
    /// Source nid presented in the header
    src: Nid,
}

/// A free floating MD committed to an operation we initiate
struct Source {
    cpt: usize,
    buffer: MdBuf,
    length: usize,
    user_ptr: u64,
}

impl NetState {
    /// Add a simulated failure rule dropping `threshold` messages exchanged with
    /// `nid` ([`FAIL_FOREVER`] for no limit), or remove the rules for `nid` if
    /// `threshold` is 0. [`NID_ANY`] applies to every peer.
    pub fn fail_nid(&self, nid: Nid, threshold: u32) {
        let mut shared = self.net.lock_default();
        if threshold == 0 {
            shared.fail.retain(|rule| !nid.is_any() && rule.nid != nid);
        } else {
            shared.fail.push(FailRule {
                nid,
                threshold: (threshold != FAIL_FOREVER).then_some(threshold),
            });
        }
        self.has_fail_rules
            .store(!shared.fail.is_empty(), Ordering::Release);
        debug!("{} failure rule(s)", shared.fail.len());
    }

    /// Whether a message exchanged with `nid` fails on purpose
    pub(crate) fn fail_peer(&self, nid: Nid, outgoing: bool) -> bool {
        if !self.has_fail_rules.load(Ordering::Acquire) {
            return false;
        }
        let mut shared = self.net.lock_default();
        let mut fail = false;
        shared.fail.retain_mut(|rule| {
            if !rule.nid.is_any() && rule.nid != nid {
                return true;
            }
            fail = true;
            match rule.threshold.as_mut() {
                None => true,
                Some(left) => {
                    *left -= 1;
                    *left > 0
                }
            }
        });
        self.has_fail_rules
            .store(!shared.fail.is_empty(), Ordering::Release);
        if fail {
            debug!(
                "simulated {} failure with {nid}",
                if outgoing { "send" } else { "receive" }
            );
        }
        fail
    }

    fn count(&self, nid: Nid, update: impl FnOnce(&mut Counters)) {
        let cpt = self.cpts.cpt_of_nid(nid);
        update(&mut self.net.lock(cpt).counters);
    }

    /// Commit the free floating MD `md` to an operation we initiate
    fn md_source(&self, md: Handle<Md>) -> Result<Source, LNetError> {
        let cpt = md.cookie().cpt(self.cpts.bits());
        if cpt >= self.cpts.count() {
            return Err(LNetError::NotFound);
        }
        let mut part = self.res.lock(cpt);
        let obj = part.mds.get_mut(md.cookie()).ok_or(LNetError::NotFound)?;
        if obj.threshold == Some(0) || obj.me.is_some() {
            return Err(LNetError::NotFound);
        }
        obj.commit();
        Ok(Source {
            cpt,
            buffer: obj.buffer.clone(),
            length: obj.length,
            user_ptr: obj.user_ptr,
        })
    }

    /// Pick the interface and next hop towards `dest`
    fn select(&self, self_nid: Nid, dest: Nid) -> Result<Hop, LNetError> {
        let next = {
            let shared = self.net.lock_default();
            if shared.ni.shutdown {
                return Err(LNetError::NetworkDown);
            }
            if !self_nid.is_any() && shared.ni.find_nid(self_nid).is_none() {
                return Err(LNetError::InvalidArgument("source nid is not local"));
            }
            if shared.ni.find_nid(dest).is_some() {
                let ni = shared.ni.loni.clone().ok_or(LNetError::NetworkDown)?;
                let src = if self_nid.is_any() { dest } else { self_nid };
                return Ok(Hop {
                    ni,
                    peer: dest,
                    src,
                });
            }
            if shared.ni.find_net(dest.net()).is_some() {
                dest
            } else {
                shared
                    .routes
                    .best(dest.net())
                    .ok_or(LNetError::HostUnreachable)?
                    .gateway
            }
        };
        let ni = self.peer_ni(next)?;
        if !self_nid.is_any() && self_nid != ni.nid {
            return Err(LNetError::InvalidArgument("no route from the source nid"));
        }
        if !self.peer_alive(&ni, next) {
            debug!("peer {next} is dead");
            return Err(LNetError::HostUnreachable);
        }
        Ok(Hop {
            src: ni.nid,
            ni,
            peer: next,
        })
    }

    /// Hand a message to the driver of `ni`, holding a reference on `ni`
    fn transmit(&self, ni: &Arc<Ni>, msg: LndMsg, routed: bool) -> Result<(), LNetError> {
        let peer = msg.peer;
        let dest = msg.hdr.dest.nid;
        let len = msg.payload.len();
        let cpt = self.cpts.cpt_of_nid(peer);
        trace!("{} {} -> {} via {peer}", msg.hdr.body.kind(), msg.hdr.src, msg.hdr.dest);
        self.count(dest, Counters::msg_alloc);
        self.ni_addref(ni, cpt);
        let rc = ni.lnd.send(ni, msg, self);
        self.ni_decref(ni, cpt);
        self.count(dest, |c| {
            c.msg_free();
            match &rc {
                Ok(()) if routed => c.routed(len),
                Ok(()) => c.sent(len),
                Err(_) => c.errors += 1,
            }
        });
        if rc.is_ok() {
            self.peer_traffic(peer, true);
        }
        rc
    }

    fn send_msg(&self, self_nid: Nid, dest: ProcessId, body: MsgBody, payload: Bytes) -> Result<(), LNetError> {
        let hop = self.select(self_nid, dest.nid)?;
        let hdr = Header {
            dest,
            src: ProcessId::new(hop.src, self.pid),
            body,
        };
        self.transmit(
            &hop.ni,
            LndMsg {
                hdr,
                payload,
                peer: hop.peer,
            },
            false,
        )
    }

    /// Send the whole of the free floating MD `md` to `portal` of `target`. The
    /// outcome arrives as a SEND event, followed by an ACK event if asked for.
    ///
    /// # Errors
    ///
    /// [`LNetError::Io`] on a simulated failure, [`LNetError::NotFound`] if `md` is
    /// stale, attached, or exhausted.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        self_nid: Nid,
        md: Handle<Md>,
        ack: AckReq,
        target: ProcessId,
        portal: usize,
        match_bits: u64,
        offset: usize,
        hdr_data: u64,
    ) -> Result<(), LNetError> {
        if self.fail_peer(target.nid, true) {
            debug!("dropping PUT to {target}: simulated failure");
            return Err(LNetError::Io);
        }
        let source = self.md_source(md)?;
        let ack_wmd = match ack {
            AckReq::Ack => WireHandle {
                interface_cookie: self.interface_cookie,
                object_cookie: md.cookie(),
            },
            AckReq::NoAck => WireHandle::NONE,
        };
        let body = MsgBody::Put {
            ack_wmd,
            match_bits,
            ptl_index: portal,
            offset,
            hdr_data,
        };
        let payload = Bytes::from(source.buffer.read(0, source.length));

        let mut event = Event::new(EventKind::Send, md, source.user_ptr);
        event.target = target;
        event.initiator = ProcessId::new(self_nid, self.pid);
        event.pt_index = portal;
        event.match_bits = match_bits;
        event.rlength = source.length;
        event.mlength = source.length;
        event.offset = offset;
        event.hdr_data = hdr_data;
        if let Err(e) = self.send_msg(self_nid, target, body, payload) {
            debug!("error sending PUT to {target}: {e}");
            event.status = e.errno();
        }
        self.md_finalize(source.cpt, md.cookie(), event);
        Ok(())
    }

    /// Fetch into the free floating MD `md` from `portal` of `target`. The outcome
    /// arrives as a SEND event, and a REPLY event once the data is in.
    ///
    /// # Errors
    ///
    /// [`LNetError::Io`] on a simulated failure, [`LNetError::NotFound`] if `md` is
    /// stale, attached, or exhausted.
    pub fn get(
        &self,
        self_nid: Nid,
        md: Handle<Md>,
        target: ProcessId,
        portal: usize,
        match_bits: u64,
        offset: usize,
    ) -> Result<(), LNetError> {
        if self.fail_peer(target.nid, true) {
            debug!("dropping GET to {target}: simulated failure");
            return Err(LNetError::Io);
        }
        let source = self.md_source(md)?;
        let body = MsgBody::Get {
            return_wmd: WireHandle {
                interface_cookie: self.interface_cookie,
                object_cookie: md.cookie(),
            },
            match_bits,
            ptl_index: portal,
            src_offset: offset,
            sink_length: source.length,
        };

        let mut event = Event::new(EventKind::Send, md, source.user_ptr);
        event.target = target;
        event.initiator = ProcessId::new(self_nid, self.pid);
        event.pt_index = portal;
        event.match_bits = match_bits;
        event.rlength = source.length;
        event.offset = offset;
        if let Err(e) = self.send_msg(self_nid, target, body, Bytes::new()) {
            debug!("error sending GET to {target}: {e}");
            event.status = e.errno();
        }
        self.md_finalize(source.cpt, md.cookie(), event);
        Ok(())
    }

    fn drop_msg(&self, msg: &LndMsg, reason: &str) {
        debug!(
            "dropping {} from {} to {}: {reason}",
            msg.hdr.body.kind(),
            msg.hdr.src,
            msg.hdr.dest
        );
        let len = msg.payload.len();
        self.count(msg.hdr.src.nid, |c| {
            c.dropped(len);
            c.msg_free();
        });
    }

    fn msg_done(&self, msg: &LndMsg) {
        self.count(msg.hdr.src.nid, Counters::msg_free);
    }

    /// Drop a PUT that found no buffer
    pub(crate) fn drop_put(&self, put: DelayedPut, reason: &str) {
        self.drop_msg(&put.msg, reason);
    }

    /// Deliver a PUT into the MD it matched, acknowledging it if asked to
    pub(crate) fn recv_put(&self, put: DelayedPut, matched: Matched) {
        let DelayedPut { msg, info, .. } = put;
        let MsgBody::Put {
            ack_wmd, hdr_data, ..
        } = msg.hdr.body
        else {
            unreachable!("delivering a {} as a PUT", msg.hdr.body.kind());
        };
        matched
            .buffer
            .write(matched.offset, &msg.payload[..matched.mlength]);

        let mut event = Event::new(EventKind::Put, matched.md_handle(), matched.user_ptr);
        event.target = msg.hdr.dest;
        event.initiator = msg.hdr.src;
        event.sender = msg.peer;
        event.pt_index = info.portal;
        event.match_bits = info.match_bits;
        event.rlength = info.rlength;
        event.mlength = matched.mlength;
        event.offset = matched.offset;
        event.hdr_data = hdr_data;

        if !ack_wmd.is_none() && !matched.options.contains(MdOptions::ACK_DISABLE) {
            let body = MsgBody::Ack {
                dst_wmd: ack_wmd,
                match_bits: info.match_bits,
                mlength: matched.mlength,
            };
            if let Err(e) = self.send_msg(msg.hdr.dest.nid, msg.hdr.src, body, Bytes::new()) {
                debug!("failed to acknowledge PUT from {}: {e}", msg.hdr.src);
                event.status = e.errno();
            }
        }
        self.md_finalize(matched.cpt, matched.md, event);
        self.msg_done(&msg);
    }

    fn parse_put(&self, ni: &Arc<Ni>, msg: LndMsg) {
        let MsgBody::Put {
            match_bits,
            ptl_index,
            offset,
            ..
        } = msg.hdr.body
        else {
            return;
        };
        let info = MatchInfo {
            src: msg.hdr.src,
            portal: ptl_index,
            opc: MdOptions::OP_PUT,
            match_bits,
            rlength: msg.payload.len(),
            roffset: offset,
        };
        let mut pending = Some(DelayedPut {
            ni: ni.clone(),
            msg,
            info,
        });
        match self.match_put(&mut pending) {
            Verdict::Matched(matched) => {
                if let Some(put) = pending.take() {
                    self.recv_put(put, matched);
                }
            }
            Verdict::Delayed => debug!("PUT delayed on lazy portal {ptl_index}"),
            Verdict::Dropped => {
                if let Some(put) = pending.take() {
                    self.drop_put(put, "no match");
                }
            }
        }
    }

    fn parse_get(&self, msg: LndMsg) {
        let MsgBody::Get {
            return_wmd,
            match_bits,
            ptl_index,
            src_offset,
            sink_length,
        } = msg.hdr.body
        else {
            return;
        };
        let info = MatchInfo {
            src: msg.hdr.src,
            portal: ptl_index,
            opc: MdOptions::OP_GET,
            match_bits,
            rlength: sink_length,
            roffset: src_offset,
        };
        let Verdict::Matched(matched) = self.match_get(&info) else {
            self.drop_msg(&msg, "no match");
            return;
        };
        let data = Bytes::from(matched.buffer.read(matched.offset, matched.mlength));

        let mut event = Event::new(EventKind::Get, matched.md_handle(), matched.user_ptr);
        event.target = msg.hdr.dest;
        event.initiator = msg.hdr.src;
        event.sender = msg.peer;
        event.pt_index = ptl_index;
        event.match_bits = match_bits;
        event.rlength = sink_length;
        event.mlength = matched.mlength;
        event.offset = matched.offset;

        let body = MsgBody::Reply {
            dst_wmd: return_wmd,
        };
        if let Err(e) = self.send_msg(msg.hdr.dest.nid, msg.hdr.src, body, data) {
            debug!("failed to reply to GET from {}: {e}", msg.hdr.src);
            event.status = e.errno();
        }
        self.md_finalize(matched.cpt, matched.md, event);
        self.msg_done(&msg);
    }

    /// Commit the MD a REPLY or an ACK is for, returning its partition
    fn md_sink(&self, wmd: WireHandle) -> Result<(usize, Cookie), &'static str> {
        if wmd.interface_cookie != self.interface_cookie {
            return Err("stale interface cookie");
        }
        let cookie = wmd.object_cookie;
        let cpt = cookie.cpt(self.cpts.bits());
        if cpt >= self.cpts.count() {
            return Err("bad MD cookie");
        }
        let mut part = self.res.lock(cpt);
        match part.mds.get_mut(cookie) {
            Some(md) if md.threshold != Some(0) && md.me.is_none() => {
                md.commit();
                Ok((cpt, cookie))
            }
            _ => Err("no active MD"),
        }
    }

    fn parse_reply(&self, msg: LndMsg) {
        let MsgBody::Reply { dst_wmd } = msg.hdr.body else {
            return;
        };
        let rlength = msg.payload.len();
        let (cpt, cookie, buffer, user_ptr, mlength) = {
            let (cpt, cookie) = match self.md_sink(dst_wmd) {
                Ok(found) => found,
                Err(reason) => return self.drop_msg(&msg, reason),
            };
            let mut part = self.res.lock(cpt);
            let Some(md) = part.md_mut(cookie) else {
                drop(part);
                return self.drop_msg(&msg, "MD vanished");
            };
            let mlength = rlength.min(md.length);
            if rlength > md.length && !md.options.contains(MdOptions::TRUNCATE) {
                // undo the commit: the reply is not taken
                md.refcount -= 1;
                if let Some(threshold) = md.threshold.as_mut() {
                    *threshold += 1;
                }
                drop(part);
                return self.drop_msg(&msg, "reply too large for the MD");
            }
            (cpt, cookie, md.buffer.clone(), md.user_ptr, mlength)
        };
        buffer.write(0, &msg.payload[..mlength]);

        let mut event = Event::new(EventKind::Reply, Handle::from_cookie(cookie), user_ptr);
        event.target = msg.hdr.src;
        event.initiator = msg.hdr.dest;
        event.sender = msg.peer;
        event.rlength = rlength;
        event.mlength = mlength;
        self.md_finalize(cpt, cookie, event);
        self.msg_done(&msg);
    }

    fn parse_ack(&self, msg: LndMsg) {
        let MsgBody::Ack {
            dst_wmd,
            match_bits,
            mlength,
        } = msg.hdr.body
        else {
            return;
        };
        let (cpt, cookie) = match self.md_sink(dst_wmd) {
            Ok(found) => found,
            Err(reason) => return self.drop_msg(&msg, reason),
        };
        let user_ptr = self
            .res
            .lock(cpt)
            .md_mut(cookie)
            .map_or(0, |md| md.user_ptr);

        let mut event = Event::new(EventKind::Ack, Handle::from_cookie(cookie), user_ptr);
        event.target = msg.hdr.src;
        event.initiator = msg.hdr.dest;
        event.sender = msg.peer;
        event.match_bits = match_bits;
        event.rlength = mlength;
        event.mlength = mlength;
        self.md_finalize(cpt, cookie, event);
        self.msg_done(&msg);
    }

    /// Pass on a message for another node, using a router buffer for the duration
    fn forward(&self, msg: LndMsg) {
        let len = msg.payload.len();
        let cpt = self.cpts.cpt_of_nid(msg.hdr.src.nid);
        if !self.rtrbuf_take(cpt, len) {
            return self.drop_msg(&msg, "out of router buffers");
        }
        let hop = match self.select(NID_ANY, msg.hdr.dest.nid) {
            Ok(hop) => hop,
            Err(e) => {
                self.rtrbuf_give(cpt, len);
                return self.drop_msg(&msg, &e.to_string());
            }
        };
        let src = msg.hdr.src.nid;
        let fwd = LndMsg {
            hdr: msg.hdr,
            payload: msg.payload,
            peer: hop.peer,
        };
        if let Err(e) = self.transmit(&hop.ni, fwd, true) {
            debug!("failed to forward from {src}: {e}");
        }
        self.rtrbuf_give(cpt, len);
        self.count(src, Counters::msg_free);
    }
}

impl LNetRx for NetState {
    fn parse(&self, ni: &Arc<Ni>, msg: LndMsg) -> Result<(), LNetError> {
        let len = msg.payload.len();
        match msg.hdr.body {
            MsgBody::Put { .. } | MsgBody::Reply { .. } if len > LNET_MTU => {
                warn!("bad {} from {}: payload of {len} bytes", msg.hdr.body.kind(), msg.hdr.src);
                return Err(LNetError::Protocol("payload too large"));
            }
            MsgBody::Get { .. } | MsgBody::Ack { .. } if len > 0 => {
                warn!("bad {} from {}: unexpected payload", msg.hdr.body.kind(), msg.hdr.src);
                return Err(LNetError::Protocol("unexpected payload"));
            }
            _ => {}
        }
        if self.get_routing() && ni.touch(self.now_secs()) && ni.status() != NI_STATUS_UP {
            ni.set_status(NI_STATUS_UP);
        }

        let dest = msg.hdr.dest.nid;
        let loopback = ni.net().lnd() == Some(LndType::Lo);
        let for_me = dest == ni.nid || (loopback && self.is_local_nid(dest));
        if !for_me {
            if dest.net() == ni.net() {
                warn!("message for {dest} from {} should have gone direct", msg.hdr.src);
                return Err(LNetError::Protocol("misdirected message"));
            }
            if self.is_local_nid(dest) {
                warn!("message for {dest} from {} should have gone through {dest}", msg.hdr.src);
                return Err(LNetError::Protocol("message for another local interface"));
            }
        }

        self.count(msg.hdr.src.nid, |c| {
            c.msg_alloc();
            c.received(len);
        });
        if !for_me && !self.get_routing() {
            self.drop_msg(&msg, "routing not enabled");
            return Ok(());
        }
        if self.fail_peer(msg.hdr.src.nid, false) {
            self.drop_msg(&msg, "simulated failure");
            return Ok(());
        }
        if !loopback {
            if let Err(e) = self.peer_ni(msg.peer) {
                self.drop_msg(&msg, &e.to_string());
                return Ok(());
            }
            self.peer_traffic(msg.peer, false);
        }

        if !for_me {
            self.forward(msg);
            return Ok(());
        }
        match msg.hdr.body {
            MsgBody::Put { .. } => self.parse_put(ni, msg),
            MsgBody::Get { .. } => self.parse_get(msg),
            MsgBody::Reply { .. } => self.parse_reply(msg),
            MsgBody::Ack { .. } => self.parse_ack(msg),
        }
        Ok(())
    }

    fn notify(&self, ni: &Ni, peer: Nid, alive: bool, when: Instant) {
        if let Err(e) = self.notify_peer(Some(ni), peer, alive, when) {
            debug!("ignoring news of {peer} from {}: {e}", ni.nid);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::eq::Polled;
    use crate::lnd::NiSetup;
    use crate::lnd::lo::LoLnd;
    use crate::lnd::testing::TestLnd;
    use crate::md::{Unlink, UserMd};
    use crate::me::InsPos;
    use crate::net::tests::bare_state;
    use crate::nid::NetId;
    use crate::route::Route;
    use pretty_assertions::assert_eq;

    /// A state with the loopback interface and a test interface at 10.0.0.1@tcp
    pub(crate) fn running_state(ncpts: usize) -> (NetState, Arc<TestLnd>, Arc<Ni>) {
        let (state, lnd) = bare_state(ncpts);
        let mut setup = NiSetup::new(NetId::LO, vec![], None);
        setup.nid = Nid::lo();
        let lo = Arc::new(Ni::new(setup, Arc::new(LoLnd), ncpts));
        let mut setup = NiSetup::new(NetId::new(LndType::Sock, 0), vec![], None);
        setup.nid = Nid::new(setup.net, 0x0a00_0001);
        setup.peertxcredits = 8;
        let ni = Arc::new(Ni::new(setup, lnd.clone(), ncpts));
        {
            let mut shared = state.net.lock_default();
            shared.ni.insert(lo.clone());
            shared.ni.loni = Some(lo);
            shared.ni.insert(ni.clone());
        }
        (state, lnd, ni)
    }

    fn nid(s: &str) -> Nid {
        s.parse().unwrap()
    }

    fn events(state: &NetState, eq: Handle<crate::handle::Eq>) -> Vec<Event> {
        std::iter::from_fn(|| state.eq_get(eq).unwrap().map(Polled::into_event))
            .map(Result::unwrap)
            .collect()
    }

    fn free_md(state: &NetState, data: &[u8], eq: Handle<crate::handle::Eq>) -> Handle<Md> {
        let umd = UserMd {
            buffer: MdBuf::from_vec(data.to_vec()),
            threshold: Some(2),
            eq: Some(eq),
            ..UserMd::default()
        };
        state.md_bind(umd, Unlink::Retain).unwrap()
    }

    fn posted(state: &NetState, portal: usize, umd: UserMd) -> Handle<Md> {
        let me = state
            .me_attach(portal, ProcessId::ANY, 0, !0, Unlink::Retain, InsPos::After)
            .unwrap();
        state.md_attach(me, umd, Unlink::Retain).unwrap()
    }

    fn incoming_put(src: Nid, dest: Nid, portal: usize, payload: &'static [u8]) -> LndMsg {
        LndMsg {
            hdr: Header {
                dest: ProcessId::new(dest, 42),
                src: ProcessId::new(src, 42),
                body: MsgBody::Put {
                    ack_wmd: WireHandle::NONE,
                    match_bits: 0,
                    ptl_index: portal,
                    offset: 0,
                    hdr_data: 0,
                },
            },
            payload: Bytes::from_static(payload),
            peer: src,
        }
    }

    #[test]
    fn put_to_self_with_ack() {
        let (state, _, ni) = running_state(1);
        let target_eq = state.eq_alloc(8).unwrap();
        let buffer = MdBuf::new(16);
        posted(
            &state,
            10,
            UserMd {
                buffer: buffer.clone(),
                options: MdOptions::OP_PUT,
                eq: Some(target_eq),
                ..UserMd::default()
            },
        );
        let source_eq = state.eq_alloc(8).unwrap();
        let md = free_md(&state, b"hello", source_eq);
        state
            .put(NID_ANY, md, AckReq::Ack, ProcessId::new(ni.nid, 42), 10, 0, 0, 7)
            .unwrap();

        let received = events(&state, target_eq);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, EventKind::Put);
        assert_eq!((received[0].mlength, received[0].hdr_data), (5, 7));
        assert_eq!(received[0].initiator.nid, ni.nid);
        assert_eq!(&buffer.to_vec()[..5], b"hello");

        let kinds: Vec<_> = events(&state, source_eq).iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Ack, EventKind::Send]);
        let counters = state.counters();
        assert_eq!(counters.msgs_alloc, 0);
        assert_eq!(counters.send_count, 2);
        assert_eq!(counters.recv_count, 2);
    }

    #[test]
    fn get_from_self() {
        let (state, _, ni) = running_state(1);
        posted(
            &state,
            11,
            UserMd {
                buffer: MdBuf::from_vec(b"abcdef".to_vec()),
                options: MdOptions::OP_GET,
                ..UserMd::default()
            },
        );
        let eq = state.eq_alloc(4).unwrap();
        let sink = MdBuf::new(4);
        let md = state
            .md_bind(
                UserMd {
                    buffer: sink.clone(),
                    threshold: Some(2),
                    eq: Some(eq),
                    ..UserMd::default()
                },
                Unlink::Unlink,
            )
            .unwrap();
        state.get(NID_ANY, md, ProcessId::new(ni.nid, 42), 11, 0, 0).unwrap();
        assert_eq!(sink.to_vec(), b"abcd".to_vec());
        let got = events(&state, eq);
        assert_eq!(got.len(), 2);
        assert_eq!((got[0].kind, got[0].mlength), (EventKind::Reply, 4));
        assert_eq!(got[1].kind, EventKind::Send);
        assert!(got[1].unlinked);
        assert_eq!(state.md_status(md), Err(LNetError::NotFound));
    }

    #[test]
    fn simulated_failures() {
        let (state, _, ni) = running_state(1);
        let eq = state.eq_alloc(8).unwrap();
        let md = free_md(&state, b"x", eq);
        let target = ProcessId::new(ni.nid, 42);
        state.fail_nid(ni.nid, 1);
        assert_eq!(
            state.put(NID_ANY, md, AckReq::NoAck, target, 1, 0, 0, 0),
            Err(LNetError::Io)
        );
        assert!(!state.has_fail_rules.load(Ordering::Acquire));
        state.fail_nid(NID_ANY, FAIL_FOREVER);
        assert!(state.fail_peer(ni.nid, true));
        assert!(state.fail_peer(nid("10.0.0.9@tcp"), false));
        state.fail_nid(NID_ANY, 0);
        assert!(!state.fail_peer(ni.nid, true));
        state.put(NID_ANY, md, AckReq::NoAck, target, 1, 0, 0, 0).unwrap();
    }

    #[test]
    fn unreachable_and_stale() {
        let (state, _, _) = running_state(1);
        let eq = state.eq_alloc(8).unwrap();
        let md = free_md(&state, b"x", eq);
        let far = ProcessId::new(nid("10.1.0.1@o2ib"), 42);
        state.put(NID_ANY, md, AckReq::NoAck, far, 1, 0, 0, 0).unwrap();
        let sent = events(&state, eq);
        assert_eq!(sent[0].status, LNetError::HostUnreachable.errno());
        assert_eq!(
            state.put(NID_ANY, Handle::INVALID, AckReq::NoAck, far, 1, 0, 0, 0),
            Err(LNetError::NotFound)
        );
        let attached = posted(
            &state,
            2,
            UserMd {
                options: MdOptions::OP_PUT,
                ..UserMd::default()
            },
        );
        assert_eq!(
            state.get(NID_ANY, attached, far, 1, 0, 0),
            Err(LNetError::NotFound)
        );
        // a foreign source nid fails the send, not the call
        state
            .put(nid("10.9.9.9@tcp"), md, AckReq::NoAck, far, 1, 0, 0, 0)
            .unwrap();
        let sent = events(&state, eq);
        assert_eq!(sent[0].status, -22);
        assert_eq!(state.md_status(md).unwrap().threshold, Some(0));
    }

    #[test]
    fn sends_go_through_the_driver() {
        let (state, lnd, ni) = running_state(2);
        let eq = state.eq_alloc(8).unwrap();
        let md = free_md(&state, b"payload", eq);
        let peer = nid("10.0.0.7@tcp");
        state
            .put(NID_ANY, md, AckReq::NoAck, ProcessId::new(peer, 42), 3, 0x11, 0, 0)
            .unwrap();
        let sent = lnd.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer, peer);
        assert_eq!(sent[0].hdr.src, ProcessId::new(ni.nid, 42));
        assert_eq!(sent[0].payload, Bytes::from_static(b"payload"));
        assert_eq!(state.net.lock(state.cpts.cpt_of_nid(peer)).peers.get(peer).unwrap().sent, 1);
    }

    #[test]
    fn malformed_messages() {
        let (state, _, ni) = running_state(1);
        let mut msg = incoming_put(nid("10.0.0.5@tcp"), nid("10.0.0.6@tcp"), 1, b"");
        assert_eq!(
            state.parse(&ni, msg.clone()),
            Err(LNetError::Protocol("misdirected message"))
        );
        msg.hdr.dest.nid = ni.nid;
        msg.hdr.body = MsgBody::Ack {
            dst_wmd: WireHandle::NONE,
            match_bits: 0,
            mlength: 0,
        };
        msg.payload = Bytes::from_static(b"junk");
        assert_eq!(
            state.parse(&ni, msg),
            Err(LNetError::Protocol("unexpected payload"))
        );

        // not a router: dropped
        let msg = incoming_put(nid("10.0.0.5@tcp"), nid("10.1.0.1@o2ib"), 1, b"abc");
        state.parse(&ni, msg).unwrap();
        let counters = state.counters();
        assert_eq!((counters.drop_count, counters.drop_length), (1, 3));
        assert_eq!(counters.msgs_alloc, 0);
    }

    #[test]
    fn forwarding() {
        let (state, lnd, ni) = running_state(1);
        state.rtrpools_alloc(true);
        let gateway = nid("10.0.0.9@tcp");
        state.net.lock_default().routes.add(Route {
            net: NetId::new(LndType::O2ib, 0),
            gateway,
            hops: 1,
            priority: 0,
        });
        let msg = incoming_put(nid("10.0.0.5@tcp"), nid("10.1.0.1@o2ib"), 1, b"abc");
        state.parse(&ni, msg.clone()).unwrap();
        let sent = lnd.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer, gateway);
        assert_eq!(sent[0].hdr, msg.hdr);
        let counters = state.counters();
        assert_eq!((counters.route_count, counters.route_length), (1, 3));
        assert_eq!(counters.msgs_alloc, 0);
        let pools = state.net.lock(0).rtrpools.clone().unwrap();
        assert_eq!(pools.small.credits, pools.small.nbuffers);
    }

    #[test]
    fn lazy_portal_holds_puts() {
        let (state, _, ni) = running_state(1);
        state.set_lazy_portal(12).unwrap();
        let msg = incoming_put(nid("10.0.0.5@tcp"), ni.nid, 12, b"late");
        state.parse(&ni, msg).unwrap();
        assert_eq!(state.portal(12).unwrap().delayed(), 1);
        assert_eq!(state.counters().msgs_alloc, 1);

        let eq = state.eq_alloc(4).unwrap();
        let buffer = MdBuf::new(8);
        posted(
            &state,
            12,
            UserMd {
                buffer: buffer.clone(),
                options: MdOptions::OP_PUT,
                eq: Some(eq),
                ..UserMd::default()
            },
        );
        assert_eq!(state.portal(12).unwrap().delayed(), 0);
        let got = events(&state, eq);
        assert_eq!((got[0].kind, got[0].mlength), (EventKind::Put, 4));
        assert_eq!(&buffer.to_vec()[..4], b"late");
        assert_eq!(state.counters().msgs_alloc, 0);

        // clearing drops what is still delayed
        state
            .parse(&ni, incoming_put(nid("10.0.0.5@tcp"), ni.nid, 13, b"x"))
            .unwrap();
        assert_eq!(state.counters().drop_count, 1);
        state.set_lazy_portal(13).unwrap();
        state
            .parse(&ni, incoming_put(nid("10.0.0.5@tcp"), ni.nid, 13, b"x"))
            .unwrap();
        state.clear_lazy_portal(13).unwrap();
        assert_eq!(state.counters().drop_count, 2);
    }

    #[test]
    fn reset_while_a_put_is_delayed() {
        let (state, _, ni) = running_state(1);
        state.set_lazy_portal(12).unwrap();
        state
            .parse(&ni, incoming_put(nid("10.0.0.5@tcp"), ni.nid, 12, b"held"))
            .unwrap();
        assert_eq!(state.portal(12).unwrap().delayed(), 1);

        state.reset_counters();
        let counters = state.counters();
        assert_eq!((counters.msgs_alloc, counters.msgs_max), (1, 1));
        assert_eq!(counters.recv_count, 0);

        // releasing the held PUT frees its message
        state.clear_lazy_portal(12).unwrap();
        let counters = state.counters();
        assert_eq!(counters.msgs_alloc, 0);
        assert_eq!((counters.drop_count, counters.drop_length), (1, 4));
    }

    #[test]
    fn buffer_posted_between_tables_takes_the_put() {
        let (state, _, ni) = running_state(2);
        state.set_lazy_portal(12).unwrap();
        let msg = incoming_put(nid("10.0.0.5@tcp"), ni.nid, 12, b"race");
        let info = MatchInfo {
            src: msg.hdr.src,
            portal: 12,
            opc: MdOptions::OP_PUT,
            match_bits: 0,
            rlength: 4,
            roffset: 0,
        };
        let ptl = state.portal(12).unwrap();
        // the PUT missed on the first table and has yet to look at the second
        let ticket = ptl.steal_begin(&info);

        let eq = state.eq_alloc(4).unwrap();
        let buffer = MdBuf::new(8);
        let md = posted(
            &state,
            12,
            UserMd {
                buffer: buffer.clone(),
                options: MdOptions::OP_PUT,
                eq: Some(eq),
                ..UserMd::default()
            },
        );
        assert_eq!(ptl.stealing(), 1);
        assert_eq!(ptl.delayed(), 0);
        assert!(events(&state, eq).is_empty());

        let mut pending = Some(DelayedPut {
            ni: ni.clone(),
            msg,
            info: info.clone(),
        });
        let Verdict::Matched(matched) = state.scan_put(ptl, &info, &mut pending, (1, 1), Some(ticket))
        else {
            panic!("PUT not given to the buffer posted during its scan");
        };
        assert_eq!(matched.md_handle(), md);
        assert_eq!(ptl.stealing(), 0);
        state.recv_put(pending.take().unwrap(), matched);
        let got = events(&state, eq);
        assert_eq!((got[0].kind, got[0].mlength), (EventKind::Put, 4));
        assert_eq!(&buffer.to_vec()[..4], b"race");

        // a scan nobody interrupts ends up delayed, and leaves no trace
        state.set_lazy_portal(13).unwrap();
        state
            .parse(&ni, incoming_put(nid("10.0.0.5@tcp"), ni.nid, 13, b"late"))
            .unwrap();
        let ptl = state.portal(13).unwrap();
        assert_eq!((ptl.delayed(), ptl.stealing()), (1, 0));
    }
}
