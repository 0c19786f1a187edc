// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Portals and match tables.
//!
//! Each portal has one match table per partition. A portal is typed by its first
//! match entry: "unique" if that entry matches one exact source and exact match
//! bits, "wildcard" otherwise. Entries of unique portals are hashed by
//! `{match bits, nid, pid}`, both to pick the partition and the bucket inside it.
//!
//! Wildcard portals keep track of the partitions with posted buffers (the active
//! set) so that incoming messages go to a partition that has something to match
//! instead of stealing buffers across partitions.

use crate::cpt::{CPT_MAX, hash_long};
use crate::errors::LNetError;
use crate::handle::{Cookie, Eq, Handle, Md};
use crate::md::{MdBuf, MdObj, MdOptions};
use crate::me::{InsPos, MeObj};
use crate::msg::LndMsg;
use crate::net::{NetState, ResPartition};
use crate::ni::Ni;
use crate::nid::{PID_ANY, ProcessId};
use ahash::RandomState;
use arrayvec::ArrayVec;
use bitflags::bitflags;
use concurrency::sync::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use tracing::{debug, warn};

tracectl::trace_target!("portal", tracectl::LevelFilter::INFO, &["lnet", "portal"]);

/// Number of portals
pub const MAX_PORTALS: usize = 64;
/// Buckets of a unique match table, as a power of two
pub const MT_HASH_BITS: u32 = 8;
/// Seconds an exhausted match table stays in the active set
pub const MT_DEADLINE: u64 = 5;

bitflags! {
    /// Portal attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortalOptions: u32 {
        /// Unmatched PUTs wait for a buffer instead of being dropped
        const LAZY = 1 << 0;
        /// Entries match exact sources and bits
        const UNIQUE = 1 << 1;
        /// Entries may match many sources or bits
        const WILDCARD = 1 << 2;
    }
}

/// Whether a match entry selects exactly one source and one set of bits
#[must_use]
pub fn match_is_unique(id: ProcessId, ignore_bits: u64) -> bool {
    ignore_bits == 0 && !id.nid.is_any() && id.pid != PID_ANY
}

/// Key of a unique entry
fn unique_key(id: ProcessId, match_bits: u64) -> u64 {
    match_bits
        .wrapping_add(id.nid.raw())
        .wrapping_add(u64::from(id.pid))
}

/// The match entries of one portal on one partition
#[derive(Debug, Default)]
pub struct MatchTable {
    /// Entries of a wildcard portal, in matching order
    mlist: Vec<Cookie>,
    /// Entries of a unique portal, by bucket
    mhash: HashMap<u64, Vec<Cookie>, RandomState>,
}

impl MatchTable {
    pub(crate) fn chain(&self, bucket: Option<u64>) -> &[Cookie] {
        match bucket {
            None => &self.mlist,
            Some(bucket) => self.mhash.get(&bucket).map_or(&[], Vec::as_slice),
        }
    }

    fn chain_mut(&mut self, bucket: Option<u64>) -> &mut Vec<Cookie> {
        match bucket {
            None => &mut self.mlist,
            Some(bucket) => self.mhash.entry(bucket).or_default(),
        }
    }

    pub(crate) fn push(&mut self, cookie: Cookie, bucket: Option<u64>, tail: bool) {
        let chain = self.chain_mut(bucket);
        if tail {
            chain.push(cookie);
        } else {
            chain.insert(0, cookie);
        }
    }

    /// Insert `cookie` next to `current`; false if `current` is not here
    pub(crate) fn insert_near(&mut self, current: Cookie, cookie: Cookie, after: bool) -> bool {
        let Some(pos) = self.mlist.iter().position(|&c| c == current) else {
            return false;
        };
        self.mlist.insert(pos + usize::from(after), cookie);
        true
    }

    pub(crate) fn remove(&mut self, cookie: Cookie, bucket: Option<u64>) {
        let chain = self.chain_mut(bucket);
        chain.retain(|&c| c != cookie);
        if let Some(bucket) = bucket {
            if chain.is_empty() {
                self.mhash.remove(&bucket);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mlist.len() + self.mhash.values().map(Vec::len).sum::<usize>()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry, returning how many there were
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.len();
        self.mlist.clear();
        self.mhash.clear();
        count
    }
}

/// A PUT waiting on a lazy portal
pub(crate) struct DelayedPut {
    pub(crate) ni: Arc<Ni>,
    pub(crate) msg: LndMsg,
    pub(crate) info: MatchInfo,
}

/// A PUT in the middle of scanning the tables of a lazy portal. An MD attached
/// meanwhile may claim it, and the scan then stops there.
struct Stealing {
    ticket: u64,
    info: MatchInfo,
    claim: Option<Claim>,
}

enum Claim {
    Matched(Matched),
    Drop,
}

#[derive(Default)]
struct PortalInner {
    /// Active partitions, sorted
    maps: ArrayVec<usize, CPT_MAX>,
    delayed: VecDeque<DelayedPut>,
    stealing: Vec<Stealing>,
    next_ticket: u64,
}

impl PortalInner {
    /// What an attached MD did with the scan `ticket`, forgetting the scan if claimed
    fn take_claim(&mut self, ticket: u64) -> Option<Claim> {
        let pos = self
            .stealing
            .iter()
            .position(|s| s.ticket == ticket && s.claim.is_some())?;
        self.stealing.swap_remove(pos).claim
    }

    fn steal_end(&mut self, ticket: u64) {
        self.stealing.retain(|s| s.ticket != ticket);
    }
}

/// A portal
pub struct Portal {
    index: usize,
    options: AtomicU32,
    /// Per partition: when a buffer was last posted (coarse seconds), 0 if inactive
    lastpost: Box<[AtomicU64]>,
    inner: Mutex<PortalInner>,
}

impl Portal {
    pub(crate) fn new(index: usize, ncpts: usize) -> Self {
        Self {
            index,
            options: AtomicU32::new(0),
            lastpost: (0..ncpts).map(|_| AtomicU64::new(0)).collect(),
            inner: Mutex::new(PortalInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortalInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn options(&self) -> PortalOptions {
        PortalOptions::from_bits_truncate(self.options.load(Ordering::Acquire))
    }

    fn set_option(&self, opt: PortalOptions) {
        self.options.fetch_or(opt.bits(), Ordering::AcqRel);
    }

    fn unset_option(&self, opt: PortalOptions) {
        self.options.fetch_and(!opt.bits(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_lazy(&self) -> bool {
        self.options().contains(PortalOptions::LAZY)
    }

    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.options().contains(PortalOptions::UNIQUE)
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.options().contains(PortalOptions::WILDCARD)
    }

    /// Type the portal on first use, and check that an entry fits its type
    pub(crate) fn match_type(&self, id: ProcessId, ignore_bits: u64) -> bool {
        let unique = match_is_unique(id, ignore_bits);
        let opts = self.options();
        if opts.intersects(PortalOptions::UNIQUE | PortalOptions::WILDCARD) {
            return opts.contains(PortalOptions::UNIQUE) == unique;
        }
        let _inner = self.lock();
        let opts = self.options();
        if opts.intersects(PortalOptions::UNIQUE | PortalOptions::WILDCARD) {
            // typed by someone else meanwhile
            return opts.contains(PortalOptions::UNIQUE) == unique;
        }
        self.set_option(if unique {
            PortalOptions::UNIQUE
        } else {
            PortalOptions::WILDCARD
        });
        debug!("portal {} is {}", self.index, if unique { "unique" } else { "wildcard" });
        true
    }

    /// Bucket of an entry or message in a unique table
    pub(crate) fn bucket(&self, id: ProcessId, match_bits: u64) -> Option<u64> {
        self.is_unique()
            .then(|| hash_long(unique_key(id, match_bits), MT_HASH_BITS))
    }

    #[must_use]
    pub fn lastpost(&self, cpt: usize) -> u64 {
        self.lastpost[cpt].load(Ordering::Acquire)
    }

    /// Partitions with posted buffers
    #[must_use]
    pub fn active(&self) -> Vec<usize> {
        self.lock().maps.to_vec()
    }

    /// Number of PUTs waiting for a buffer
    #[must_use]
    pub fn delayed(&self) -> usize {
        self.lock().delayed.len()
    }

    /// Note a buffer posted on partition `cpt` at time `now`.
    /// The caller holds the object lock of partition `cpt`.
    pub(crate) fn enable_mt(&self, cpt: usize, now: u64) {
        if self.lastpost[cpt].load(Ordering::Acquire) != 0 {
            self.lastpost[cpt].store(now, Ordering::Release);
            return;
        }
        let mut inner = self.lock();
        self.lastpost[cpt].store(now, Ordering::Release);
        if let Err(pos) = inner.maps.binary_search(&cpt) {
            inner.maps.insert(pos, cpt);
        }
    }

    /// Take partition `cpt` out of the active set once it has been exhausted for
    /// [`MT_DEADLINE`]. The caller holds the object lock of partition `cpt`.
    pub(crate) fn disable_mt(&self, cpt: usize, now: u64) {
        let lastpost = self.lastpost[cpt].load(Ordering::Acquire);
        if lastpost == 0 || now.saturating_sub(lastpost) < MT_DEADLINE {
            return;
        }
        let mut inner = self.lock();
        self.lastpost[cpt].store(0, Ordering::Release);
        if let Ok(pos) = inner.maps.binary_search(&cpt) {
            inner.maps.remove(pos);
        }
    }

    /// Queue an unmatched PUT if the portal is lazy; hands it back otherwise
    fn delay(&self, put: DelayedPut) -> Option<DelayedPut> {
        let mut inner = self.lock();
        self.queue(&mut inner, put)
    }

    fn queue(&self, inner: &mut PortalInner, put: DelayedPut) -> Option<DelayedPut> {
        if !self.is_lazy() {
            return Some(put);
        }
        inner.delayed.push_back(put);
        None
    }

    /// Register a PUT about to scan the tables
    pub(crate) fn steal_begin(&self, info: &MatchInfo) -> u64 {
        let mut inner = self.lock();
        let ticket = inner.next_ticket;
        inner.next_ticket = ticket.wrapping_add(1);
        inner.stealing.push(Stealing {
            ticket,
            info: info.clone(),
            claim: None,
        });
        ticket
    }

    /// Number of PUTs scanning the tables right now
    #[must_use]
    pub fn stealing(&self) -> usize {
        self.lock().stealing.len()
    }
}

/// What an incoming message asks to match
#[derive(Debug, Clone)]
pub(crate) struct MatchInfo {
    pub(crate) src: ProcessId,
    pub(crate) portal: usize,
    pub(crate) opc: MdOptions,
    pub(crate) match_bits: u64,
    pub(crate) rlength: usize,
    pub(crate) roffset: usize,
}

/// A message matched onto an MD, which now counts it as pending
#[derive(Debug, Clone)]
pub(crate) struct Matched {
    pub(crate) cpt: usize,
    pub(crate) md: Cookie,
    pub(crate) buffer: MdBuf,
    pub(crate) user_ptr: u64,
    pub(crate) eq: Option<Handle<Eq>>,
    pub(crate) options: MdOptions,
    pub(crate) offset: usize,
    pub(crate) mlength: usize,
}

impl Matched {
    fn new(cpt: usize, cookie: Cookie, md: &MdObj, offset: usize, mlength: usize) -> Self {
        Self {
            cpt,
            md: cookie,
            buffer: md.buffer.clone(),
            user_ptr: md.user_ptr,
            eq: md.eq,
            options: md.options,
            offset,
            mlength,
        }
    }

    pub(crate) fn md_handle(&self) -> Handle<Md> {
        Handle::from_cookie(self.md)
    }
}

/// Outcome of matching a message
pub(crate) enum Verdict {
    Matched(Matched),
    /// Queued on a lazy portal
    Delayed,
    Dropped,
}

enum MdMatch {
    /// Not this MD; `exhausted` if it cannot take anything anymore
    None { exhausted: bool },
    Ok { offset: usize, mlength: usize, unlink: bool },
    Drop,
}

/// Match a message against the MD of one entry, and commit the MD if it matches
fn md_match(me: &MeObj, md: &mut MdObj, info: &MatchInfo) -> MdMatch {
    if md.exhausted() {
        return MdMatch::None { exhausted: true };
    }
    if !md.options.intersects(info.opc) {
        return MdMatch::None { exhausted: false };
    }
    if !me.match_id.nid.is_any() && me.match_id.nid != info.src.nid {
        return MdMatch::None { exhausted: false };
    }
    if me.match_id.pid != PID_ANY && me.match_id.pid != info.src.pid {
        return MdMatch::None { exhausted: false };
    }
    if (me.match_bits ^ info.match_bits) & !me.ignore_bits != 0 {
        return MdMatch::None { exhausted: false };
    }

    let offset = if md.options.contains(MdOptions::MANAGE_REMOTE) {
        info.roffset
    } else {
        md.offset
    };
    let mut mlength = if md.options.contains(MdOptions::MAX_SIZE) {
        md.max_size
    } else {
        md.length.saturating_sub(offset)
    };
    if info.rlength <= mlength {
        mlength = info.rlength;
    } else if !md.options.contains(MdOptions::TRUNCATE) {
        debug!(
            "matching {} bytes from {} too big for MD {}: {mlength} left",
            info.rlength, info.src, md.cookie
        );
        return MdMatch::Drop;
    }

    md.offset = offset + mlength;
    md.commit();
    MdMatch::Ok {
        offset,
        mlength,
        unlink: md.auto_unlink && md.exhausted(),
    }
}

enum TableMatch {
    Matched(Matched),
    Drop,
    None { exhausted: bool },
}

impl NetState {
    /// The partition bound to the interface `nid` is reached through, if any
    fn affinity_cpt(&self, id: ProcessId) -> Option<usize> {
        if id.nid.is_any() || !self.has_affinity.load(Ordering::Acquire) {
            return None;
        }
        let shared = self.net.lock_default();
        let ni = shared.ni.cpt_nis.iter().find(|ni| ni.net() == id.nid.net())?;
        let cpts = ni.cpts.as_ref().filter(|cpts| !cpts.is_empty())?;
        #[allow(clippy::cast_possible_truncation)]
        let pick = (hash_long(id.nid.raw(), 32) as usize) % cpts.len();
        Some(cpts[pick])
    }

    fn unique_cpt(&self, id: ProcessId, match_bits: u64) -> usize {
        self.cpts.cpt_of_hash(unique_key(id, match_bits))
    }

    /// Partition whose match table a new entry goes to
    pub(crate) fn mt_of_attach(
        &self,
        ptl: &Portal,
        id: ProcessId,
        match_bits: u64,
        pos: InsPos,
    ) -> usize {
        if self.cpts.count() == 1 {
            return 0;
        }
        if let Some(cpt) = self.affinity_cpt(id) {
            return cpt;
        }
        if ptl.is_unique() {
            return self.unique_cpt(id, match_bits);
        }
        match pos {
            // administrative insertions all land on one table
            InsPos::Before | InsPos::After => ptl.index % self.cpts.count(),
            InsPos::Local => self.cpts.current(),
            InsPos::None => panic!("invalid insertion position for portal {}", ptl.index),
        }
    }

    /// Partition whose match table an incoming message is matched against first
    pub(crate) fn mt_of_match(&self, ptl: &Portal, id: ProcessId, match_bits: u64) -> usize {
        if self.cpts.count() == 1 {
            return 0;
        }
        if let Some(cpt) = self.affinity_cpt(id) {
            return cpt;
        }
        if ptl.is_unique() {
            return self.unique_cpt(id, match_bits);
        }
        let cpt = self.cpts.current();
        if ptl.lastpost(cpt) != 0 {
            return cpt;
        }
        let inner = ptl.lock();
        if inner.maps.is_empty() {
            cpt
        } else {
            inner.maps[cpt % inner.maps.len()]
        }
    }

    /// Match against the table of `ptl` on the partition `part` belongs to
    fn mt_match(&self, part: &mut ResPartition, cpt: usize, ptl: &Portal, info: &MatchInfo) -> TableMatch {
        let bucket = ptl.bucket(info.src, info.match_bits);
        let mut exhausted = true;
        let mut found = None;
        {
            let ResPartition { mes, mds, mtables, .. } = &mut *part;
            for &me_cookie in mtables[ptl.index].chain(bucket) {
                let Some(me) = mes.get(me_cookie) else {
                    continue;
                };
                let Some(md_cookie) = me.md else {
                    // entry without buffer yet
                    continue;
                };
                let Some(md) = mds.get_mut(md_cookie) else {
                    continue;
                };
                match md_match(me, md, info) {
                    MdMatch::None { exhausted: md_exhausted } => {
                        exhausted &= md_exhausted;
                    }
                    MdMatch::Drop => return TableMatch::Drop,
                    MdMatch::Ok {
                        offset,
                        mlength,
                        unlink,
                    } => {
                        found = Some((Matched::new(cpt, md_cookie, md, offset, mlength), unlink));
                        break;
                    }
                }
            }
        }
        if let Some((matched, unlink)) = found {
            if unlink {
                // the MD is busy: this only detaches it and marks it for unlink
                self.md_unlink_locked(part, matched.md);
            }
            return TableMatch::Matched(matched);
        }
        if info.opc == MdOptions::OP_GET || !ptl.is_lazy() {
            return TableMatch::Drop;
        }
        TableMatch::None { exhausted }
    }

    /// Match an incoming GET
    pub(crate) fn match_get(&self, info: &MatchInfo) -> Verdict {
        let Ok(ptl) = self.portal(info.portal) else {
            return Verdict::Dropped;
        };
        let cpt = self.mt_of_match(ptl, info.src, info.match_bits);
        let mut part = self.res.lock(cpt);
        match self.mt_match(&mut part, cpt, ptl, info) {
            TableMatch::Matched(matched) => Verdict::Matched(matched),
            TableMatch::Drop | TableMatch::None { .. } => Verdict::Dropped,
        }
    }

    /// Match an incoming PUT. Starts on an active table; lazy portals try every
    /// table before queueing the message, which `pending` then hands over.
    pub(crate) fn match_put(&self, pending: &mut Option<DelayedPut>) -> Verdict {
        let Some(info) = pending.as_ref().map(|put| put.info.clone()) else {
            return Verdict::Dropped;
        };
        let Ok(ptl) = self.portal(info.portal) else {
            return Verdict::Dropped;
        };
        let ncpts = self.cpts.count();
        let (start, ntables) = if ptl.is_unique() {
            (self.mt_of_match(ptl, info.src, info.match_bits), 1)
        } else {
            let cpt = self.cpts.current();
            let inner = ptl.lock();
            let start = if inner.maps.is_empty() {
                cpt
            } else {
                inner.maps[cpt % inner.maps.len()]
            };
            (start, ncpts)
        };
        // an MD attached while a lazy PUT is between tables must still see it
        let ticket = (ntables > 1 && ptl.is_lazy()).then(|| ptl.steal_begin(&info));
        self.scan_put(ptl, &info, pending, (start, ntables), ticket)
    }

    /// Try the `ntables` tables from `start` on. With a `ticket`, each table is
    /// matched under the portal lock, after checking whether an MD claimed the PUT.
    pub(crate) fn scan_put(
        &self,
        ptl: &Portal,
        info: &MatchInfo,
        pending: &mut Option<DelayedPut>,
        (start, ntables): (usize, usize),
        ticket: Option<u64>,
    ) -> Verdict {
        let ncpts = self.cpts.count();
        for i in 0..ntables {
            let cpt = (start + i) % ncpts;
            let last = i == ntables - 1;
            if ptl.lastpost(cpt) == 0 && !last {
                continue;
            }
            let mut part = self.res.lock(cpt);
            let mut scan = ticket.map(|ticket| (ticket, ptl.lock()));
            if let Some((ticket, inner)) = scan.as_mut() {
                match inner.take_claim(*ticket) {
                    Some(Claim::Matched(matched)) => return Verdict::Matched(matched),
                    Some(Claim::Drop) => return Verdict::Dropped,
                    None => {}
                }
            }
            let exhausted = match self.mt_match(&mut part, cpt, ptl, info) {
                TableMatch::None { exhausted } => exhausted,
                done => {
                    if let Some((ticket, inner)) = scan.as_mut() {
                        inner.steal_end(*ticket);
                    }
                    return match done {
                        TableMatch::Matched(matched) => Verdict::Matched(matched),
                        TableMatch::Drop | TableMatch::None { .. } => Verdict::Dropped,
                    };
                }
            };
            let mut verdict = None;
            if last {
                let put = pending.take();
                let handed_back = match scan.as_mut() {
                    Some((ticket, inner)) => {
                        inner.steal_end(*ticket);
                        put.and_then(|put| ptl.queue(inner, put))
                    }
                    None => put.and_then(|put| ptl.delay(put)),
                };
                verdict = Some(match handed_back {
                    None => Verdict::Delayed,
                    Some(put) => {
                        *pending = Some(put);
                        Verdict::Dropped
                    }
                });
            }
            drop(scan);
            if ptl.is_wildcard() && exhausted {
                ptl.disable_mt(cpt, self.now_secs());
            }
            drop(part);
            if let Some(verdict) = verdict {
                return verdict;
            }
        }
        Verdict::Dropped
    }

    /// Offer PUTs still scanning the tables, then delayed PUTs, to a brand new MD
    /// attached to entry `me_cookie`. Scanning PUTs it claims are finished by their
    /// own scan. Returns the delayed PUTs it took, and those to drop.
    pub(crate) fn match_delayed(
        &self,
        part: &mut ResPartition,
        ptl: &Portal,
        me_cookie: Cookie,
        md_cookie: Cookie,
    ) -> (Vec<(DelayedPut, Matched)>, Vec<DelayedPut>) {
        let mut matches = vec![];
        let mut drops = vec![];
        let mut inner = ptl.lock();
        if inner.delayed.is_empty() && inner.stealing.is_empty() {
            return (matches, drops);
        }
        let cpt = md_cookie.cpt(self.cpts.bits());
        let ResPartition { mes, mds, .. } = &mut *part;
        let (Some(me), Some(md)) = (mes.get(me_cookie), mds.get_mut(md_cookie)) else {
            return (matches, drops);
        };
        let PortalInner {
            delayed, stealing, ..
        } = &mut *inner;
        let mut unlink = false;
        for scan in stealing.iter_mut().filter(|s| s.claim.is_none()) {
            if md.exhausted() {
                break;
            }
            scan.claim = match md_match(me, md, &scan.info) {
                MdMatch::None { .. } => continue,
                MdMatch::Drop => Some(Claim::Drop),
                MdMatch::Ok {
                    offset,
                    mlength,
                    unlink: exhausted,
                } => {
                    unlink |= exhausted;
                    Some(Claim::Matched(Matched::new(cpt, md_cookie, md, offset, mlength)))
                }
            };
        }
        let mut kept = VecDeque::with_capacity(delayed.len());
        while let Some(put) = delayed.pop_front() {
            if md.exhausted() {
                kept.push_back(put);
                continue;
            }
            match md_match(me, md, &put.info) {
                MdMatch::None { .. } => kept.push_back(put),
                MdMatch::Drop => drops.push(put),
                MdMatch::Ok {
                    offset,
                    mlength,
                    unlink: exhausted,
                } => {
                    unlink |= exhausted;
                    let matched = Matched::new(cpt, md_cookie, md, offset, mlength);
                    matches.push((put, matched));
                }
            }
        }
        *delayed = kept;
        drop(inner);
        if unlink {
            self.md_unlink_locked(part, md_cookie);
        }
        (matches, drops)
    }

    /// Make portal `index` lazy
    ///
    /// # Errors
    ///
    /// Fails on a bad portal index.
    pub fn set_lazy_portal(&self, index: usize) -> Result<(), LNetError> {
        let ptl = self.portal(index)?;
        debug!("setting portal {index} lazy");
        let _inner = ptl.lock();
        ptl.set_option(PortalOptions::LAZY);
        Ok(())
    }

    /// Make portal `index` eager again, dropping the PUTs it delayed
    ///
    /// # Errors
    ///
    /// Fails on a bad portal index.
    pub fn clear_lazy_portal(&self, index: usize) -> Result<(), LNetError> {
        let ptl = self.portal(index)?;
        let zombies = {
            let mut inner = ptl.lock();
            if !ptl.is_lazy() {
                return Ok(());
            }
            ptl.unset_option(PortalOptions::LAZY);
            std::mem::take(&mut inner.delayed)
        };
        let count = zombies.len();
        for put in zombies {
            self.drop_put(put, "clearing lazy portal attr");
        }
        if self.net.lock_default().ni.shutdown {
            warn!("active lazy portal {index} on exit");
        } else {
            debug!("cleared portal {index} lazy, dropped {count} delayed PUT(s)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tests::bare_state;
    use crate::nid::{NetId, Nid, LndType};

    #[test]
    fn portal_typing() {
        let ptl = Portal::new(3, 1);
        let exact = ProcessId::new(Nid::new(NetId::new(LndType::Sock, 0), 7), 12);
        assert!(ptl.match_type(exact, 0));
        assert!(ptl.is_unique());
        assert!(!ptl.match_type(ProcessId::ANY, 0));
        assert!(!ptl.match_type(exact, 0xff));
        assert!(ptl.bucket(exact, 1).is_some());

        let ptl = Portal::new(4, 1);
        assert!(ptl.match_type(ProcessId::ANY, u64::MAX));
        assert!(ptl.is_wildcard());
        assert!(!ptl.match_type(exact, 0));
        assert_eq!(ptl.bucket(exact, 1), None);
    }

    #[test]
    fn active_set_stays_sorted() {
        let ptl = Portal::new(0, 8);
        for cpt in [5, 1, 7, 1, 3] {
            ptl.enable_mt(cpt, 10);
        }
        assert_eq!(ptl.active(), vec![1, 3, 5, 7]);
        assert_eq!(ptl.lastpost(5), 10);

        // exhausted tables stay active until the deadline passes
        ptl.disable_mt(3, 10 + MT_DEADLINE - 1);
        assert_eq!(ptl.active(), vec![1, 3, 5, 7]);
        ptl.disable_mt(3, 10 + MT_DEADLINE);
        assert_eq!(ptl.active(), vec![1, 5, 7]);
        assert_eq!(ptl.lastpost(3), 0);
        // inactive tables are left alone
        ptl.disable_mt(2, 100);
        assert_eq!(ptl.active(), vec![1, 5, 7]);
    }

    #[test]
    fn table_ordering() {
        let mut table = MatchTable::default();
        let c = |n| Cookie::from_raw(n);
        table.push(c(1), None, true);
        table.push(c(2), None, true);
        table.push(c(0), None, false);
        assert!(table.insert_near(c(1), c(9), true));
        assert!(!table.insert_near(c(42), c(10), true));
        assert_eq!(table.chain(None), &[c(0), c(1), c(9), c(2)]);
        table.push(c(5), Some(3), true);
        assert_eq!(table.len(), 5);
        table.remove(c(5), Some(3));
        table.remove(c(9), None);
        assert_eq!(table.len(), 3);
        assert_eq!(table.clear(), 3);
        assert!(table.is_empty());
    }

    #[test]
    fn single_partition_always_maps_to_zero() {
        let (state, _) = bare_state(1);
        let ptl = state.portal(5).unwrap();
        let id = ProcessId::new(Nid::new(NetId::new(LndType::Sock, 0), 1), 1);
        for pos in [InsPos::Before, InsPos::After, InsPos::Local] {
            assert_eq!(state.mt_of_attach(ptl, id, 77, pos), 0);
        }
        assert_eq!(state.mt_of_match(ptl, id, 77), 0);
        // even an invalid position does not matter with one partition
        assert_eq!(state.mt_of_attach(ptl, id, 77, InsPos::None), 0);
    }

    #[test]
    fn administrative_insertions_are_deterministic() {
        let (state, _) = bare_state(4);
        let ptl = state.portal(6).unwrap();
        assert!(ptl.match_type(ProcessId::ANY, u64::MAX));
        assert_eq!(state.mt_of_attach(ptl, ProcessId::ANY, 0, InsPos::Before), 2);
        assert_eq!(state.mt_of_attach(ptl, ProcessId::ANY, 0, InsPos::After), 2);
    }

    #[test]
    fn unique_entries_hash_to_a_partition() {
        let (state, _) = bare_state(4);
        let ptl = state.portal(7).unwrap();
        let id = ProcessId::new(Nid::new(NetId::new(LndType::Sock, 0), 9), 3);
        assert!(ptl.match_type(id, 0));
        let cpt = state.mt_of_attach(ptl, id, 0x1234, InsPos::Local);
        assert!(cpt < 4);
        // attach and match agree whatever the calling cpu
        assert_eq!(state.mt_of_match(ptl, id, 0x1234), cpt);
        assert_eq!(state.mt_of_attach(ptl, id, 0x1234, InsPos::After), cpt);
    }

    #[test]
    fn matching_avoids_stealing() {
        let (state, _) = bare_state(4);
        let ptl = state.portal(8).unwrap();
        assert!(ptl.match_type(ProcessId::ANY, u64::MAX));
        // only partition 2 has posted buffers: wherever we run, go there
        ptl.enable_mt(2, 1);
        assert_eq!(state.mt_of_match(ptl, ProcessId::ANY, 0), 2);
        ptl.enable_mt(0, 1);
        ptl.enable_mt(1, 1);
        ptl.enable_mt(3, 1);
        assert!(state.mt_of_match(ptl, ProcessId::ANY, 0) < 4);
    }

    #[test]
    #[should_panic(expected = "invalid insertion position")]
    fn invalid_position_is_fatal() {
        let (state, _) = bare_state(2);
        let ptl = state.portal(9).unwrap();
        assert!(ptl.match_type(ProcessId::ANY, u64::MAX));
        state.mt_of_attach(ptl, ProcessId::ANY, 0, InsPos::None);
    }
}
