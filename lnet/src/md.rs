// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Memory descriptors.
//!
//! An MD describes a buffer that messages are moved to or from. It is either
//! attached to a match entry, to be matched by incoming PUTs and GETs, or bound
//! on its own, as the source of an outgoing PUT or the sink of a GET's reply.
//!
//! Each message in flight on an MD holds a reference on it. Unlinking a busy MD
//! invalidates its handle right away, but the MD itself lives on until the last
//! pending operation finalizes; the event of that operation has `unlinked` set.

use crate::errors::LNetError;
use crate::handle::{Cookie, Eq, Handle, Md, Me};
use crate::msg::{Event, EventKind};
use crate::net::{NetState, ResPartition};
use bitflags::bitflags;
use concurrency::sync::Mutex;
use std::sync::{Arc, PoisonError};
use tracing::debug;

tracectl::trace_target!("md", tracectl::LevelFilter::INFO, &["lnet"]);

bitflags! {
    /// What an MD accepts, and how
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MdOptions: u32 {
        /// Can be the target of PUTs
        const OP_PUT = 1 << 0;
        /// Can be the target of GETs
        const OP_GET = 1 << 1;
        /// The initiator picks the offset
        const MANAGE_REMOTE = 1 << 2;
        /// Take the head of messages too large for the buffer
        const TRUNCATE = 1 << 4;
        /// Never send ACKs for PUTs landing here
        const ACK_DISABLE = 1 << 5;
        /// Take at most `max_size` bytes per message
        const MAX_SIZE = 1 << 7;
    }
}

/// A buffer shared between the caller and LNet
#[derive(Debug, Clone, Default)]
pub struct MdBuf(Arc<Mutex<Vec<u8>>>);

impl MdBuf {
    /// A zeroed buffer of `len` bytes
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(data)))
    }

    fn lock(&self) -> concurrency::sync::MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Copy out up to `len` bytes from `offset`
    #[must_use]
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let data = self.lock();
        let start = offset.min(data.len());
        let end = start.saturating_add(len).min(data.len());
        data[start..end].to_vec()
    }

    /// Copy `bytes` in at `offset`, as much as fits; returns the count copied
    pub fn write(&self, offset: usize, bytes: &[u8]) -> usize {
        let mut data = self.lock();
        let start = offset.min(data.len());
        let count = bytes.len().min(data.len() - start);
        data[start..start + count].copy_from_slice(&bytes[..count]);
        count
    }
}

/// What to do with a match entry or MD once it is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unlink {
    #[default]
    Retain,
    Unlink,
}

/// An MD as described by the caller
#[derive(Debug, Clone, Default)]
pub struct UserMd {
    pub buffer: MdBuf,
    /// Operations accepted before the MD is exhausted; `None` for no limit
    pub threshold: Option<u32>,
    /// Per message limit, with [`MdOptions::MAX_SIZE`]
    pub max_size: usize,
    pub options: MdOptions,
    /// Opaque value handed back in events
    pub user_ptr: u64,
    /// Where events go, if anywhere
    pub eq: Option<Handle<Eq>>,
}

/// A live MD
#[derive(Debug)]
pub struct MdObj {
    pub(crate) cookie: Cookie,
    pub(crate) buffer: MdBuf,
    pub(crate) length: usize,
    /// Running offset of locally managed MDs
    pub(crate) offset: usize,
    pub(crate) max_size: usize,
    pub(crate) threshold: Option<u32>,
    pub(crate) options: MdOptions,
    pub(crate) user_ptr: u64,
    pub(crate) eq: Option<Handle<Eq>>,
    /// The match entry this MD is attached to
    pub(crate) me: Option<Cookie>,
    /// Operations in flight
    pub(crate) refcount: u32,
    /// Unlinked, waiting for operations in flight
    pub(crate) zombie: bool,
    pub(crate) auto_unlink: bool,
}

impl MdObj {
    fn new(cookie: Cookie, umd: UserMd, unlink: Unlink) -> Self {
        Self {
            cookie,
            length: umd.buffer.len(),
            buffer: umd.buffer,
            offset: 0,
            max_size: umd.max_size,
            threshold: umd.threshold,
            options: umd.options,
            user_ptr: umd.user_ptr,
            eq: umd.eq,
            me: None,
            refcount: 0,
            zombie: false,
            auto_unlink: unlink == Unlink::Unlink,
        }
    }

    /// Whether the MD cannot take any more operations
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.threshold == Some(0)
            || (self.options.contains(MdOptions::MAX_SIZE)
                && self.offset + self.max_size > self.length)
    }

    /// Whether the MD goes away once its last operation finalizes
    fn unlinkable(&self) -> bool {
        self.refcount == 0 && (self.zombie || (self.auto_unlink && self.exhausted()))
    }

    /// Count one more operation on the MD
    pub(crate) fn commit(&mut self) {
        if let Some(threshold) = self.threshold.as_mut() {
            *threshold -= 1;
        }
        self.refcount += 1;
    }

    #[must_use]
    pub fn handle(&self) -> Handle<Md> {
        Handle::from_cookie(self.cookie)
    }

    #[must_use]
    pub fn threshold(&self) -> Option<u32> {
        self.threshold
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// State of an MD as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdStatus {
    pub threshold: Option<u32>,
    pub offset: usize,
    pub pending: u32,
    pub attached: bool,
}

fn validate(umd: &UserMd) -> Result<(), LNetError> {
    if umd.options.contains(MdOptions::MAX_SIZE)
        && (umd.max_size == 0 || umd.max_size > umd.buffer.len())
    {
        return Err(LNetError::InvalidArgument("MD max size out of bounds"));
    }
    Ok(())
}

impl NetState {
    /// Take a reference on an event queue for a new MD.
    /// The caller holds the object lock of the MD's partition.
    fn eq_hold(&self, eq: Option<Handle<Eq>>) -> Result<(), LNetError> {
        let Some(eq) = eq else {
            return Ok(());
        };
        let mut shared = self.res.lock_default();
        let eq = shared.eqs.get_mut(eq.cookie()).ok_or(LNetError::NotFound)?;
        eq.refcount += 1;
        Ok(())
    }

    /// Attach an MD to match entry `me`
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] on bad options, [`LNetError::NotFound`] for a
    /// stale match entry or event queue, [`LNetError::Busy`] if the match entry has
    /// an MD already.
    pub fn md_attach(&self, me: Handle<Me>, umd: UserMd, unlink: Unlink) -> Result<Handle<Md>, LNetError> {
        validate(&umd)?;
        if !umd.options.intersects(MdOptions::OP_PUT | MdOptions::OP_GET) {
            return Err(LNetError::InvalidArgument("attached MD accepts no operation"));
        }
        let cpt = me.cookie().cpt(self.cpts.bits());
        if cpt >= self.cpts.count() {
            return Err(LNetError::NotFound);
        }

        let mut part = self.res.lock(cpt);
        let entry = part.mes.get(me.cookie()).ok_or(LNetError::NotFound)?;
        if entry.md.is_some() {
            return Err(LNetError::Busy);
        }
        let portal = entry.portal;
        self.eq_hold(umd.eq)?;
        let md = part.mds.issue_with(|cookie| {
            let mut md = MdObj::new(cookie, umd, unlink);
            md.me = Some(me.cookie());
            md
        });
        if let Some(entry) = part.mes.get_mut(me.cookie()) {
            entry.md = Some(md);
        }
        debug!("attached MD {md} to ME {me} on portal {portal}");

        let ptl = self.portal(portal)?;
        let (matches, drops) = self.match_delayed(&mut part, ptl, me.cookie(), md);
        let live = part.mds.get(md).is_some_and(|md| !md.exhausted());
        if live && ptl.is_wildcard() {
            ptl.enable_mt(cpt, self.now_secs());
        }
        drop(part);

        for put in drops {
            self.drop_put(put, "too large for the new MD");
        }
        for (put, matched) in matches {
            self.recv_put(put, matched);
        }
        Ok(Handle::from_cookie(md))
    }

    /// Create a free floating MD, as the source of a PUT or the sink of a GET
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] on bad options, [`LNetError::NotFound`] for a
    /// stale event queue.
    pub fn md_bind(&self, umd: UserMd, unlink: Unlink) -> Result<Handle<Md>, LNetError> {
        validate(&umd)?;
        if umd.options.intersects(MdOptions::OP_PUT | MdOptions::OP_GET) {
            return Err(LNetError::InvalidArgument("free MD cannot take operations"));
        }
        let cpt = self.cpts.current();
        let mut part = self.res.lock(cpt);
        self.eq_hold(umd.eq)?;
        let md = part
            .mds
            .issue_with(|cookie| MdObj::new(cookie, umd, unlink));
        Ok(Handle::from_cookie(md))
    }

    /// Unlink an MD. An idle MD goes away now, with an UNLINK event; a busy one
    /// when its last operation finalizes.
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] for a stale handle.
    pub fn md_unlink(&self, md: Handle<Md>) -> Result<(), LNetError> {
        let cpt = md.cookie().cpt(self.cpts.bits());
        if cpt >= self.cpts.count() {
            return Err(LNetError::NotFound);
        }
        let mut part = self.res.lock(cpt);
        let obj = part.mds.get(md.cookie()).ok_or(LNetError::NotFound)?;
        if let (Some(eq), 0) = (obj.eq, obj.refcount) {
            let mut event = Event::new(EventKind::Unlink, md, obj.user_ptr);
            event.rlength = obj.length;
            event.mlength = obj.length;
            event.offset = obj.offset;
            event.unlinked = true;
            self.enqueue(eq, event);
        }
        self.md_unlink_locked(&mut part, md.cookie());
        Ok(())
    }

    /// What is left of an MD
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] for a stale handle.
    pub fn md_status(&self, md: Handle<Md>) -> Result<MdStatus, LNetError> {
        let cpt = md.cookie().cpt(self.cpts.bits());
        if cpt >= self.cpts.count() {
            return Err(LNetError::NotFound);
        }
        let part = self.res.lock(cpt);
        let obj = part.mds.get(md.cookie()).ok_or(LNetError::NotFound)?;
        Ok(MdStatus {
            threshold: obj.threshold,
            offset: obj.offset,
            pending: obj.refcount,
            attached: obj.me.is_some(),
        })
    }

    /// Invalidate an MD and detach it from its match entry, unlinking the entry
    /// too if it asked for it. Frees the MD unless operations are in flight.
    /// The caller holds the object lock of the MD's partition.
    pub(crate) fn md_unlink_locked(&self, part: &mut ResPartition, cookie: Cookie) {
        let Some(mut md) = part.mds.remove(cookie) else {
            // already unlinked
            return;
        };
        md.zombie = true;
        if let Some(me) = md.me.take() {
            let unlink_me = part.mes.get_mut(me).is_some_and(|entry| {
                entry.md = None;
                entry.unlink == Unlink::Unlink
            });
            if unlink_me {
                self.me_unlink_locked(part, me);
            }
        }
        if md.refcount == 0 {
            self.md_free(md);
        } else {
            debug!("MD {cookie} unlinked with {} operation(s) pending", md.refcount);
            part.md_zombies.insert(cookie, md);
        }
    }

    fn md_free(&self, md: MdObj) {
        if let Some(eq) = md.eq {
            let mut shared = self.res.lock_default();
            if let Some(eq) = shared.eqs.get_mut(eq.cookie()) {
                eq.refcount = eq.refcount.saturating_sub(1);
            }
        }
    }

    /// Complete one operation on the MD `cookie` of partition `cpt`, delivering
    /// `event` to its event queue
    pub(crate) fn md_finalize(&self, cpt: usize, cookie: Cookie, mut event: Event) {
        let mut part = self.res.lock(cpt);
        let Some(md) = part.md_mut(cookie) else {
            debug!("MD {cookie} gone before {} completed", event.kind);
            return;
        };
        md.refcount = md.refcount.saturating_sub(1);
        let unlink = md.unlinkable();
        event.unlinked = unlink;
        if let Some(eq) = md.eq {
            self.enqueue(eq, event);
        }
        if !unlink {
            return;
        }
        if part.mds.get(cookie).is_some() {
            self.md_unlink_locked(&mut part, cookie);
        } else if let Some(md) = part.md_zombies.remove(&cookie) {
            self.md_free(md);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tests::bare_state;

    #[test]
    fn buffer_access_is_bounded() {
        let buf = MdBuf::new(4);
        assert_eq!(buf.write(2, b"abcd"), 2);
        assert_eq!(buf.to_vec(), b"\0\0ab");
        assert_eq!(buf.read(1, 10), b"\0ab");
        assert!(buf.read(9, 1).is_empty());
        assert_eq!(buf.write(9, b"x"), 0);
    }

    #[test]
    fn exhaustion() {
        let umd = UserMd {
            buffer: MdBuf::new(100),
            threshold: Some(1),
            options: MdOptions::OP_PUT | MdOptions::MAX_SIZE,
            max_size: 40,
            ..UserMd::default()
        };
        let mut md = MdObj::new(Cookie::from_raw(1), umd, Unlink::Unlink);
        assert!(!md.exhausted());
        md.offset = 70;
        assert!(md.exhausted());
        md.offset = 0;
        md.commit();
        assert!(md.exhausted());
        assert!(!md.unlinkable());
        md.refcount = 0;
        assert!(md.unlinkable());
    }

    #[test]
    fn bind_checks_options() {
        let (state, _) = bare_state(1);
        let umd = UserMd {
            buffer: MdBuf::new(8),
            options: MdOptions::OP_GET,
            ..UserMd::default()
        };
        assert!(matches!(
            state.md_bind(umd, Unlink::Unlink),
            Err(LNetError::InvalidArgument(_))
        ));
        let umd = UserMd {
            buffer: MdBuf::new(8),
            options: MdOptions::MAX_SIZE,
            max_size: 9,
            ..UserMd::default()
        };
        assert!(state.md_bind(umd, Unlink::Unlink).is_err());

        let md = state.md_bind(UserMd::default(), Unlink::Unlink).unwrap();
        let status = state.md_status(md).unwrap();
        assert_eq!(status.threshold, None);
        assert!(!status.attached);
        state.md_unlink(md).unwrap();
        assert_eq!(state.md_unlink(md), Err(LNetError::NotFound));
        assert_eq!(state.md_status(md), Err(LNetError::NotFound));
    }

    #[test]
    fn bind_with_a_stale_eq() {
        let (state, _) = bare_state(1);
        let eq = state.eq_alloc(4).unwrap();
        state.eq_free(eq).unwrap();
        let umd = UserMd {
            eq: Some(eq),
            ..UserMd::default()
        };
        assert_eq!(state.md_bind(umd, Unlink::Retain), Err(LNetError::NotFound));
    }

    #[test]
    fn busy_md_lives_until_finalized() {
        let (state, _) = bare_state(1);
        let eq = state.eq_alloc(4).unwrap();
        let umd = UserMd {
            eq: Some(eq),
            user_ptr: 7,
            ..UserMd::default()
        };
        let md = state.md_bind(umd, Unlink::Retain).unwrap();
        {
            let mut part = state.res.lock(0);
            part.mds.get_mut(md.cookie()).unwrap().commit();
        }
        // busy: no UNLINK event, the handle goes stale right away
        state.md_unlink(md).unwrap();
        assert_eq!(state.md_status(md), Err(LNetError::NotFound));
        assert!(state.eq_get(eq).unwrap().is_none());
        assert_eq!(state.eq_free(eq), Err(LNetError::Busy));

        state.md_finalize(0, md.cookie(), Event::new(EventKind::Send, md, 7));
        let polled = state.eq_get(eq).unwrap().unwrap();
        assert_eq!(polled.event.kind, EventKind::Send);
        assert!(polled.event.unlinked);
        assert_eq!(polled.event.md_user_ptr, 7);
        state.eq_free(eq).unwrap();
    }

    #[test]
    fn idle_unlink_reports_an_unlink_event() {
        let (state, _) = bare_state(1);
        let eq = state.eq_alloc(1).unwrap();
        let umd = UserMd {
            buffer: MdBuf::new(16),
            eq: Some(eq),
            ..UserMd::default()
        };
        let md = state.md_bind(umd, Unlink::Retain).unwrap();
        state.md_unlink(md).unwrap();
        let polled = state.eq_get(eq).unwrap().unwrap();
        assert_eq!(polled.event.kind, EventKind::Unlink);
        assert_eq!(polled.event.md_handle, md);
        assert!(polled.event.unlinked);
        assert_eq!(polled.event.rlength, 16);
    }
}
