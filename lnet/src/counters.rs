// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Message counters, kept per partition and aggregated on demand.

use concurrency::PercptLock;
use std::fmt::{Display, Formatter};

/// Counters of one partition, or an aggregate of them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Messages currently allocated
    pub msgs_alloc: u32,
    /// High-water mark of `msgs_alloc`
    pub msgs_max: u32,
    pub errors: u32,
    pub send_count: u32,
    pub recv_count: u32,
    pub route_count: u32,
    pub drop_count: u32,
    pub send_length: u64,
    pub recv_length: u64,
    pub route_length: u64,
    pub drop_length: u64,
}

impl Counters {
    pub(crate) fn msg_alloc(&mut self) {
        self.msgs_alloc += 1;
        self.msgs_max = self.msgs_max.max(self.msgs_alloc);
    }

    pub(crate) fn msg_free(&mut self) {
        self.msgs_alloc = self.msgs_alloc.saturating_sub(1);
    }

    pub(crate) fn sent(&mut self, len: usize) {
        self.send_count += 1;
        self.send_length += len as u64;
    }

    pub(crate) fn received(&mut self, len: usize) {
        self.recv_count += 1;
        self.recv_length += len as u64;
    }

    pub(crate) fn routed(&mut self, len: usize) {
        self.route_count += 1;
        self.route_length += len as u64;
    }

    pub(crate) fn dropped(&mut self, len: usize) {
        self.drop_count += 1;
        self.drop_length += len as u64;
    }

    fn accumulate(&mut self, other: &Counters) {
        self.msgs_alloc += other.msgs_alloc;
        self.msgs_max = self.msgs_max.max(other.msgs_max);
        self.errors += other.errors;
        self.send_count += other.send_count;
        self.recv_count += other.recv_count;
        self.route_count += other.route_count;
        self.drop_count += other.drop_count;
        self.send_length += other.send_length;
        self.recv_length += other.recv_length;
        self.route_length += other.route_length;
        self.drop_length += other.drop_length;
    }
}

/// Sum the counters of every partition.
///
/// Partitions are locked one at a time, so the result may mix values read before and
/// after a concurrent update on another partition.
pub fn snapshot<T: AsRef<Counters>, D>(lock: &PercptLock<T, D>) -> Counters {
    let mut total = Counters::default();
    lock.for_each(|_, part| total.accumulate(part.as_ref()));
    total
}

/// Zero the counters of every partition, with all partitions locked.
///
/// Messages still allocated stay counted, and become the new high-water mark.
pub fn reset<T: AsMut<Counters>, D>(lock: &PercptLock<T, D>) {
    let mut all = lock.lock_all();
    for part in all.parts_mut() {
        let counters = part.as_mut();
        let live = counters.msgs_alloc;
        *counters = Counters {
            msgs_alloc: live,
            msgs_max: live,
            ..Counters::default()
        };
    }
}

impl Display for Counters {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "msgs_alloc {} msgs_max {} errors {}", self.msgs_alloc, self.msgs_max, self.errors)?;
        writeln!(f, "{:>8} {:>10} {:>14}", "", "count", "bytes")?;
        writeln!(f, "{:>8} {:>10} {:>14}", "send", self.send_count, self.send_length)?;
        writeln!(f, "{:>8} {:>10} {:>14}", "recv", self.recv_count, self.recv_length)?;
        writeln!(f, "{:>8} {:>10} {:>14}", "route", self.route_count, self.route_length)?;
        write!(f, "{:>8} {:>10} {:>14}", "drop", self.drop_count, self.drop_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Slot(Counters);
    impl AsRef<Counters> for Slot {
        fn as_ref(&self) -> &Counters {
            &self.0
        }
    }
    impl AsMut<Counters> for Slot {
        fn as_mut(&mut self) -> &mut Counters {
            &mut self.0
        }
    }

    #[test]
    fn snapshot_sums_and_keeps_max() {
        let lock = PercptLock::new(3, |_| Slot(Counters::default()), ());
        for cpt in 0..3 {
            let mut part = lock.lock(cpt);
            for _ in 0..=cpt {
                part.0.msg_alloc();
                part.0.sent(100);
            }
            part.0.msg_free();
        }
        let total = snapshot(&lock);
        assert_eq!(total.send_count, 6);
        assert_eq!(total.send_length, 600);
        assert_eq!(total.msgs_alloc, 3);
        assert_eq!(total.msgs_max, 3);
    }

    #[test]
    fn reset_zeroes_everything() {
        let lock = PercptLock::new(2, |_| Slot(Counters::default()), ());
        {
            let mut part = lock.lock(1);
            part.0.msg_alloc();
            part.0.msg_free();
            part.0.dropped(10);
            part.0.routed(20);
            part.0.received(30);
        }
        reset(&lock);
        assert_eq!(snapshot(&lock), Counters::default());
    }

    #[test]
    fn reset_keeps_live_messages() {
        let lock = PercptLock::new(2, |_| Slot(Counters::default()), ());
        {
            let mut part = lock.lock(0);
            part.0.msg_alloc();
            part.0.msg_alloc();
            part.0.msg_free();
            part.0.sent(5);
        }
        reset(&lock);
        let total = snapshot(&lock);
        assert_eq!((total.msgs_alloc, total.msgs_max, total.send_count), (1, 1, 0));

        lock.lock(0).0.msg_free();
        assert_eq!(snapshot(&lock).msgs_alloc, 0);
        // a stray free does not wrap
        lock.lock(0).0.msg_free();
        assert_eq!(snapshot(&lock).msgs_alloc, 0);
    }
}
