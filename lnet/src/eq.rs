// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Event queues.
//!
//! An event queue is a ring of events, written by LNet and read by the caller.
//! Writers never wait for readers: a slow reader is lapped and finds out through
//! [`Polled::overflow`]. Event queues are not partitioned; they live behind the
//! default object lock.

use crate::errors::LNetError;
use crate::handle::{Cookie, Eq, Handle};
use crate::msg::Event;
use crate::net::NetState;
use std::sync::PoisonError;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

tracectl::trace_target!("eq", tracectl::LevelFilter::INFO, &["lnet"]);

/// Longest a waiting poll lets a driver run before checking the queues again
const WAIT_SLICE: Duration = Duration::from_secs(1);

/// An event queue
#[derive(Debug)]
pub struct EqObj {
    pub(crate) cookie: Cookie,
    events: Box<[Option<Event>]>,
    /// Sequence of the next event written
    enq_seq: u64,
    /// Sequence of the next event to read
    deq_seq: u64,
    /// MDs delivering to this queue
    pub(crate) refcount: u32,
}

impl EqObj {
    fn new(cookie: Cookie, size: usize) -> Self {
        Self {
            cookie,
            events: (0..size).map(|_| None).collect(),
            enq_seq: 1,
            deq_seq: 1,
            refcount: 0,
        }
    }

    fn slot(&self, seq: u64) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let slot = (seq & (self.events.len() as u64 - 1)) as usize;
        slot
    }

    fn push(&mut self, mut event: Event) {
        event.sequence = self.enq_seq;
        let slot = self.slot(self.enq_seq);
        self.events[slot] = Some(event);
        self.enq_seq += 1;
    }

    /// The next event, and whether events were lost before it
    fn pop(&mut self) -> Option<(Event, bool)> {
        let event = self.events[self.slot(self.deq_seq)].as_ref()?;
        if event.sequence < self.deq_seq {
            return None;
        }
        let lapped = event.sequence != self.deq_seq;
        self.deq_seq = event.sequence + 1;
        Some((event.clone(), lapped))
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn handle(&self) -> Handle<Eq> {
        Handle::from_cookie(self.cookie)
    }
}

/// An event read from one of the polled queues
#[derive(Debug, Clone, PartialEq)]
pub struct Polled {
    pub event: Event,
    /// Index of the queue in the polled list
    pub which: usize,
    /// Events were lost before this one: the reader was lapped
    pub overflow: bool,
}

impl Polled {
    /// The event, or [`LNetError::Overflow`] if events were lost before it
    ///
    /// # Errors
    ///
    /// Events were lost.
    pub fn into_event(self) -> Result<Event, LNetError> {
        if self.overflow {
            return Err(LNetError::Overflow);
        }
        Ok(self.event)
    }
}

impl NetState {
    /// Create an event queue holding at least `count` events
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] for a zero count.
    pub fn eq_alloc(&self, count: usize) -> Result<Handle<Eq>, LNetError> {
        if count == 0 {
            return Err(LNetError::InvalidArgument("event queue of no event"));
        }
        let size = count
            .checked_next_power_of_two()
            .ok_or(LNetError::InvalidArgument("event queue too large"))?;
        let mut shared = self.res.lock_default();
        let cookie = shared.eqs.issue_with(|cookie| EqObj::new(cookie, size));
        debug!("allocated EQ {cookie} of {size} events");
        Ok(Handle::from_cookie(cookie))
    }

    /// Free an event queue
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] for a stale handle, [`LNetError::Busy`] while MDs
    /// still deliver to it.
    pub fn eq_free(&self, eq: Handle<Eq>) -> Result<(), LNetError> {
        let mut shared = self.res.lock_default();
        let obj = shared.eqs.get(eq.cookie()).ok_or(LNetError::NotFound)?;
        if obj.refcount > 0 {
            return Err(LNetError::Busy);
        }
        shared.eqs.remove(eq.cookie());
        Ok(())
    }

    /// Queue `event` on `eq` and wake up pollers
    pub(crate) fn enqueue(&self, eq: Handle<Eq>, event: Event) {
        let mut shared = self.res.lock_default();
        let Some(obj) = shared.eqs.get_mut(eq.cookie()) else {
            debug!("dropping {} event for freed EQ {eq}", event.kind);
            return;
        };
        trace!("EQ {eq}: {} event, md {}", event.kind, event.md_handle);
        obj.push(event);
        self.eq_cond.notify_all();
    }

    /// Read the first event available on any of `eqs`, waiting up to `timeout_ms`
    /// milliseconds for one, or forever if negative.
    /// Returns `None` if the wait timed out.
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] for an empty list, [`LNetError::NotFound`]
    /// for a stale handle.
    pub fn eq_poll(&self, eqs: &[Handle<Eq>], timeout_ms: i32) -> Result<Option<Polled>, LNetError> {
        if eqs.is_empty() {
            return Err(LNetError::InvalidArgument("no event queue to poll"));
        }
        let deadline = u64::try_from(timeout_ms)
            .ok()
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        // drivers that cannot deliver on their own get our time slices
        let waiter = self.net.lock_default().ni.eqwait_ni.clone();

        loop {
            let mut shared = self.res.lock_default();
            for (which, eq) in eqs.iter().enumerate() {
                let obj = shared.eqs.get_mut(eq.cookie()).ok_or(LNetError::NotFound)?;
                if let Some((event, overflow)) = obj.pop() {
                    return Ok(Some(Polled {
                        event,
                        which,
                        overflow,
                    }));
                }
            }
            let left = match deadline {
                None => WAIT_SLICE,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    left.min(WAIT_SLICE)
                }
            };
            match &waiter {
                Some(ni) => {
                    drop(shared);
                    ni.lnd.wait(ni, left);
                }
                None => {
                    let (guard, _) = self
                        .eq_cond
                        .wait_timeout(shared, left)
                        .unwrap_or_else(PoisonError::into_inner);
                    drop(guard);
                }
            }
        }
    }

    /// Read the next event of `eq`, if any
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] for a stale handle.
    pub fn eq_get(&self, eq: Handle<Eq>) -> Result<Option<Polled>, LNetError> {
        self.eq_poll(&[eq], 0)
    }

    /// Wait for the next event of `eq`
    ///
    /// # Errors
    ///
    /// [`LNetError::NotFound`] for a stale handle.
    pub fn eq_wait(&self, eq: Handle<Eq>) -> Result<Polled, LNetError> {
        self.eq_poll(&[eq], -1)?.ok_or(LNetError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Md;
    use crate::msg::EventKind;
    use crate::net::tests::bare_state;
    use std::sync::Arc;
    use std::thread;

    fn event(n: u64) -> Event {
        Event::new(EventKind::Put, Handle::<Md>::INVALID, n)
    }

    #[test]
    fn ring_order_and_overflow() {
        let mut eq = EqObj::new(Cookie::from_raw(3), 4);
        assert!(eq.pop().is_none());
        for n in 0..3 {
            eq.push(event(n));
        }
        let (ev, lapped) = eq.pop().unwrap();
        assert_eq!((ev.md_user_ptr, ev.sequence, lapped), (0, 1, false));
        // five more: the reader is lapped
        for n in 3..8 {
            eq.push(event(n));
        }
        // the slot the reader expected was overwritten: it resumes there
        let (ev, lapped) = eq.pop().unwrap();
        assert!(lapped);
        assert_eq!(ev.md_user_ptr, 5);
        let (ev, lapped) = eq.pop().unwrap();
        assert!(!lapped);
        assert_eq!(ev.md_user_ptr, 6);
        let (ev, _) = eq.pop().unwrap();
        assert_eq!(ev.md_user_ptr, 7);
        assert!(eq.pop().is_none());
    }

    #[test]
    fn alloc_rounds_up() {
        let (state, _) = bare_state(1);
        assert!(matches!(state.eq_alloc(0), Err(LNetError::InvalidArgument(_))));
        let eq = state.eq_alloc(5).unwrap();
        assert_eq!(state.res.lock_default().eqs.get(eq.cookie()).unwrap().size(), 8);
        state.eq_free(eq).unwrap();
        assert_eq!(state.eq_free(eq), Err(LNetError::NotFound));
    }

    #[test]
    fn poll_checks_arguments() {
        let (state, _) = bare_state(1);
        assert!(matches!(state.eq_poll(&[], 0), Err(LNetError::InvalidArgument(_))));
        let eq = state.eq_alloc(1).unwrap();
        assert_eq!(state.eq_poll(&[eq, Handle::INVALID], 0), Err(LNetError::NotFound));
        assert_eq!(state.eq_poll(&[eq], 10), Ok(None));
    }

    #[test]
    fn poll_reports_which_queue() {
        let (state, _) = bare_state(1);
        let first = state.eq_alloc(2).unwrap();
        let second = state.eq_alloc(2).unwrap();
        state.enqueue(second, event(9));
        let polled = state.eq_poll(&[first, second], 0).unwrap().unwrap();
        assert_eq!(polled.which, 1);
        assert_eq!(polled.clone().into_event().unwrap().md_user_ptr, 9);
    }

    #[test]
    fn waiting_poll_is_woken() {
        let (state, _) = bare_state(1);
        let state = Arc::new(state);
        let eq = state.eq_alloc(2).unwrap();
        let writer = {
            let state = state.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                state.enqueue(eq, event(1));
            })
        };
        let polled = state.eq_wait(eq).unwrap();
        assert_eq!(polled.event.md_user_ptr, 1);
        writer.join().unwrap();
    }
}
