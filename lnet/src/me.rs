// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Match entries: what incoming messages on a portal are matched against.

use crate::errors::LNetError;
use crate::handle::{Cookie, Handle, Me};
use crate::md::Unlink;
use crate::msg::{Event, EventKind};
use crate::net::{NetState, ResPartition};
use crate::nid::ProcessId;
use tracing::debug;

tracectl::trace_target!("me", tracectl::LevelFilter::INFO, &["lnet"]);

/// Where a new match entry goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsPos {
    /// Head of the list, or before the given entry
    Before,
    /// Tail of the list, or after the given entry
    After,
    /// On the table of the calling CPU
    Local,
    /// Not a valid position: only there to be rejected
    None,
}

/// A match entry
#[derive(Debug)]
pub struct MeObj {
    pub(crate) cookie: Cookie,
    pub(crate) portal: usize,
    pub(crate) match_id: ProcessId,
    pub(crate) match_bits: u64,
    pub(crate) ignore_bits: u64,
    pub(crate) unlink: Unlink,
    pub(crate) md: Option<Cookie>,
    /// Hash bucket on unique portals
    pub(crate) bucket: Option<u64>,
}

impl MeObj {
    #[must_use]
    pub fn handle(&self) -> Handle<Me> {
        Handle::from_cookie(self.cookie)
    }

    #[must_use]
    pub fn portal(&self) -> usize {
        self.portal
    }
}

impl NetState {
    /// Create a match entry on `portal`
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] for a bad portal, [`LNetError::PermissionDenied`]
    /// if the entry does not fit the portal's type.
    ///
    /// # Panics
    ///
    /// Panics on [`InsPos::None`] with more than one partition.
    pub fn me_attach(
        &self,
        portal: usize,
        match_id: ProcessId,
        match_bits: u64,
        ignore_bits: u64,
        unlink: Unlink,
        pos: InsPos,
    ) -> Result<Handle<Me>, LNetError> {
        let ptl = self.portal(portal)?;
        if !ptl.match_type(match_id, ignore_bits) {
            return Err(LNetError::PermissionDenied("match entry does not fit the portal type"));
        }
        let cpt = self.mt_of_attach(ptl, match_id, match_bits, pos);
        let bucket = ptl.bucket(match_id, match_bits);

        let mut part = self.res.lock(cpt);
        let cookie = part.mes.issue_with(|cookie| MeObj {
            cookie,
            portal,
            match_id,
            match_bits,
            ignore_bits,
            unlink,
            md: None,
            bucket,
        });
        part.mtables[portal].push(cookie, bucket, pos == InsPos::After);
        debug!("ME {cookie} on portal {portal} partition {cpt}: {match_id} bits {match_bits:#x}/{ignore_bits:#x}");
        Ok(Handle::from_cookie(cookie))
    }

    /// Create a match entry next to `current`
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] for a stale `current`, [`LNetError::PermissionDenied`]
    /// on unique portals, where entries have no order.
    ///
    /// # Panics
    ///
    /// Panics on [`InsPos::None`].
    pub fn me_insert(
        &self,
        current: Handle<Me>,
        match_id: ProcessId,
        match_bits: u64,
        ignore_bits: u64,
        unlink: Unlink,
        pos: InsPos,
    ) -> Result<Handle<Me>, LNetError> {
        let after = match pos {
            InsPos::Before => false,
            InsPos::After | InsPos::Local => true,
            InsPos::None => panic!("invalid insertion position next to ME {current}"),
        };
        let cpt = current.cookie().cpt(self.cpts.bits());
        if cpt >= self.cpts.count() {
            return Err(LNetError::NotFound);
        }
        let mut part = self.res.lock(cpt);
        let portal = part
            .mes
            .get(current.cookie())
            .ok_or(LNetError::NotFound)?
            .portal;
        let ptl = self.portal(portal)?;
        if ptl.is_unique() {
            return Err(LNetError::PermissionDenied("no ordering on a unique portal"));
        }
        let cookie = part.mes.issue_with(|cookie| MeObj {
            cookie,
            portal,
            match_id,
            match_bits,
            ignore_bits,
            unlink,
            md: None,
            bucket: None,
        });
        if !part.mtables[portal].insert_near(current.cookie(), cookie, after) {
            part.mtables[portal].push(cookie, None, after);
        }
        Ok(Handle::from_cookie(cookie))
    }

    /// Unlink a match entry and the MD attached to it
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] for a stale handle.
    pub fn me_unlink(&self, me: Handle<Me>) -> Result<(), LNetError> {
        let cpt = me.cookie().cpt(self.cpts.bits());
        if cpt >= self.cpts.count() {
            return Err(LNetError::NotFound);
        }
        let mut part = self.res.lock(cpt);
        let entry = part.mes.get(me.cookie()).ok_or(LNetError::NotFound)?;
        if let Some(md) = entry.md.and_then(|md| part.mds.get(md)) {
            if let (Some(eq), 0) = (md.eq, md.refcount) {
                let mut event = Event::new(EventKind::Unlink, md.handle(), md.user_ptr);
                event.pt_index = entry.portal;
                event.match_bits = entry.match_bits;
                event.unlinked = true;
                self.enqueue(eq, event);
            }
        }
        self.me_unlink_locked(&mut part, me.cookie());
        Ok(())
    }

    /// Take a match entry off its table and invalidate it, unlinking its MD.
    /// The caller holds the object lock of the entry's partition.
    pub(crate) fn me_unlink_locked(&self, part: &mut ResPartition, cookie: Cookie) {
        let Some(me) = part.mes.remove(cookie) else {
            return;
        };
        part.mtables[me.portal].remove(cookie, me.bucket);
        if let Some(md) = me.md {
            if let Some(obj) = part.mds.get_mut(md) {
                obj.me = None;
            }
            self.md_unlink_locked(part, md);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::{MdBuf, MdOptions, UserMd};
    use crate::net::tests::bare_state;
    use crate::nid::{LndType, NetId, Nid};
    use crate::portal::MAX_PORTALS;

    fn exact() -> ProcessId {
        ProcessId::new(Nid::new(NetId::new(LndType::Sock, 0), 5), 99)
    }

    #[test]
    fn attach_checks_portal() {
        let (state, _) = bare_state(1);
        assert!(matches!(
            state.me_attach(MAX_PORTALS, ProcessId::ANY, 0, 0, Unlink::Retain, InsPos::After),
            Err(LNetError::InvalidArgument(_))
        ));
        // first entry makes portal 3 unique
        state
            .me_attach(3, exact(), 1, 0, Unlink::Retain, InsPos::After)
            .unwrap();
        assert!(matches!(
            state.me_attach(3, ProcessId::ANY, 1, !0, Unlink::Retain, InsPos::After),
            Err(LNetError::PermissionDenied(_))
        ));
    }

    #[test]
    fn insert_keeps_order() {
        let (state, _) = bare_state(1);
        let first = state
            .me_attach(4, ProcessId::ANY, 0, !0, Unlink::Retain, InsPos::After)
            .unwrap();
        let last = state
            .me_attach(4, ProcessId::ANY, 0, !0, Unlink::Retain, InsPos::After)
            .unwrap();
        let head = state
            .me_attach(4, ProcessId::ANY, 0, !0, Unlink::Retain, InsPos::Before)
            .unwrap();
        let mid = state
            .me_insert(first, ProcessId::ANY, 0, !0, Unlink::Retain, InsPos::After)
            .unwrap();
        let part = state.res.lock(0);
        let order: Vec<_> = part.mtables[4].chain(None).to_vec();
        assert_eq!(
            order,
            vec![head.cookie(), first.cookie(), mid.cookie(), last.cookie()]
        );
    }

    #[test]
    fn insert_on_unique_portal() {
        let (state, _) = bare_state(1);
        let me = state
            .me_attach(5, exact(), 1, 0, Unlink::Retain, InsPos::After)
            .unwrap();
        assert!(matches!(
            state.me_insert(me, exact(), 2, 0, Unlink::Retain, InsPos::After),
            Err(LNetError::PermissionDenied(_))
        ));
        state.me_unlink(me).unwrap();
        assert_eq!(
            state.me_insert(me, exact(), 2, 0, Unlink::Retain, InsPos::Before),
            Err(LNetError::NotFound)
        );
    }

    #[test]
    fn unlink_takes_the_md_along() {
        let (state, _) = bare_state(1);
        let eq = state.eq_alloc(8).unwrap();
        let me = state
            .me_attach(6, ProcessId::ANY, 0, !0, Unlink::Retain, InsPos::After)
            .unwrap();
        let umd = UserMd {
            buffer: MdBuf::new(64),
            options: MdOptions::OP_PUT,
            eq: Some(eq),
            ..UserMd::default()
        };
        let md = state.md_attach(me, umd.clone(), Unlink::Retain).unwrap();
        assert_eq!(state.md_attach(me, umd, Unlink::Retain), Err(LNetError::Busy));

        state.me_unlink(me).unwrap();
        assert_eq!(state.me_unlink(me), Err(LNetError::NotFound));
        assert_eq!(state.md_status(md), Err(LNetError::NotFound));
        let polled = state.eq_get(eq).unwrap().unwrap();
        assert_eq!(polled.event.kind, EventKind::Unlink);
        assert_eq!(polled.event.pt_index, 6);
        assert!(state.res.lock(0).mtables[6].is_empty());
        state.eq_free(eq).unwrap();
    }

    #[test]
    fn md_unlink_takes_an_unlink_me_along() {
        let (state, _) = bare_state(1);
        let me = state
            .me_attach(7, ProcessId::ANY, 0, !0, Unlink::Unlink, InsPos::After)
            .unwrap();
        let umd = UserMd {
            options: MdOptions::OP_GET,
            ..UserMd::default()
        };
        let md = state.md_attach(me, umd, Unlink::Retain).unwrap();
        state.md_unlink(md).unwrap();
        assert_eq!(state.me_unlink(me), Err(LNetError::NotFound));
    }
}
