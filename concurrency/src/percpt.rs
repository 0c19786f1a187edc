// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A lock sharded per CPU partition.
//!
//! A [`PercptLock`] holds one mutex per partition plus one "default" mutex. Hot paths
//! lock a single partition. Rare, global operations lock every partition in ascending
//! order, then the default one.
//!
//! Lock order is always: partitions in ascending index, then the default lock. The
//! default lock is a leaf: it may be taken while holding any partition lock, but no
//! partition lock may be taken while holding it.

use crate::sync::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};

fn acquire<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // guarded state is kept consistent before anything that may panic
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Per-partition state `T` with shared state `D` behind the default lock.
pub struct PercptLock<T, D = ()> {
    parts: Box<[Mutex<T>]>,
    default: Mutex<D>,
}

/// Guard over a single partition.
pub struct PartGuard<'a, T> {
    cpt: usize,
    guard: MutexGuard<'a, T>,
}

/// Guard over every partition and the default slot.
pub struct AllGuard<'a, T, D> {
    parts: Vec<MutexGuard<'a, T>>,
    default: MutexGuard<'a, D>,
}

impl<T, D> PercptLock<T, D> {
    /// Build a lock over `count` partitions, each initialized by `init(cpt)`.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn new(count: usize, mut init: impl FnMut(usize) -> T, default: D) -> Self {
        match Self::try_new(count, |cpt| Ok::<T, std::convert::Infallible>(init(cpt)), default) {
            Ok(lock) => lock,
            Err(never) => match never {},
        }
    }

    /// Build a lock over `count` partitions with a fallible initializer.
    ///
    /// Construction is all-or-nothing: partitions built before a failure are dropped
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by `init`.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn try_new<E>(
        count: usize,
        mut init: impl FnMut(usize) -> Result<T, E>,
        default: D,
    ) -> Result<Self, E> {
        assert!(count > 0, "a partitioned lock needs at least one partition");
        let mut parts = Vec::with_capacity(count);
        for cpt in 0..count {
            parts.push(Mutex::new(init(cpt)?));
        }
        Ok(Self {
            parts: parts.into_boxed_slice(),
            default: Mutex::new(default),
        })
    }

    /// Number of partitions
    #[must_use]
    pub fn count(&self) -> usize {
        self.parts.len()
    }

    /// Lock partition `cpt`.
    ///
    /// # Panics
    ///
    /// Panics if `cpt` is not a valid partition.
    pub fn lock(&self, cpt: usize) -> PartGuard<'_, T> {
        assert!(
            cpt < self.parts.len(),
            "partition {cpt} out of range ({})",
            self.parts.len()
        );
        PartGuard {
            cpt,
            guard: acquire(&self.parts[cpt]),
        }
    }

    /// Lock the default slot.
    ///
    /// The guard is a plain [`MutexGuard`] so that it can be handed to a condition
    /// variable.
    pub fn lock_default(&self) -> MutexGuard<'_, D> {
        acquire(&self.default)
    }

    /// Lock every partition in ascending order, then the default slot.
    pub fn lock_all(&self) -> AllGuard<'_, T, D> {
        let parts = self.parts.iter().map(acquire).collect();
        AllGuard {
            parts,
            default: acquire(&self.default),
        }
    }

    /// Visit each partition, locking them one at a time.
    pub fn for_each(&self, mut f: impl FnMut(usize, &mut T)) {
        for (cpt, part) in self.parts.iter().enumerate() {
            let mut guard = acquire(part);
            f(cpt, &mut guard);
        }
    }
}

impl<T> PartGuard<'_, T> {
    /// The partition this guard holds
    #[must_use]
    pub fn cpt(&self) -> usize {
        self.cpt
    }
}

impl<T> Deref for PartGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for PartGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, D> AllGuard<'_, T, D> {
    /// Number of partitions held
    #[must_use]
    pub fn count(&self) -> usize {
        self.parts.len()
    }

    /// Partition `cpt`
    #[must_use]
    pub fn part(&self, cpt: usize) -> &T {
        &self.parts[cpt]
    }

    /// Partition `cpt`, mutably
    pub fn part_mut(&mut self, cpt: usize) -> &mut T {
        &mut self.parts[cpt]
    }

    /// Every partition, in ascending order
    pub fn parts_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.parts.iter_mut().map(|guard| &mut **guard)
    }

    /// Every partition together with the default slot
    pub fn split_mut(&mut self) -> (Vec<&mut T>, &mut D) {
        let parts = self.parts.iter_mut().map(|guard| &mut **guard).collect();
        (parts, &mut self.default)
    }

    /// The default slot
    #[must_use]
    pub fn default(&self) -> &D {
        &self.default
    }

    /// The default slot, mutably
    pub fn default_mut(&mut self) -> &mut D {
        &mut self.default
    }
}

#[cfg(all(test, not(any(feature = "loom", feature = "shuttle"))))]
mod tests {
    use super::*;

    #[test]
    fn partitions_are_independent() {
        let lock: PercptLock<u64, u64> = PercptLock::new(4, |cpt| cpt as u64, 0);
        assert_eq!(lock.count(), 4);
        {
            let mut zero = lock.lock(0);
            // another partition stays reachable while one is held
            let mut three = lock.lock(3);
            *zero += 10;
            *three += 10;
            assert_eq!(three.cpt(), 3);
        }
        let mut seen = vec![];
        lock.for_each(|cpt, v| seen.push((cpt, *v)));
        assert_eq!(seen, vec![(0, 10), (1, 1), (2, 2), (3, 13)]);
    }

    #[test]
    fn lock_all_sees_everything() {
        let lock: PercptLock<u32, u32> = PercptLock::new(3, |_| 1, 7);
        {
            let mut all = lock.lock_all();
            assert_eq!(all.count(), 3);
            for part in all.parts_mut() {
                *part = 0;
            }
            *all.default_mut() += 1;
        }
        assert_eq!(*lock.lock_default(), 8);
        assert_eq!(*lock.lock(2), 0);
    }

    #[test]
    fn failed_construction_reports_first_error() {
        let mut built = 0;
        let res: Result<PercptLock<usize>, usize> = PercptLock::try_new(
            8,
            |cpt| {
                if cpt == 5 {
                    Err(cpt)
                } else {
                    built += 1;
                    Ok(cpt)
                }
            },
            (),
        );
        assert!(matches!(res, Err(5)));
        assert_eq!(built, 5);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_partition() {
        let lock: PercptLock<()> = PercptLock::new(2, |_| (), ());
        let _guard = lock.lock(2);
    }

    #[test]
    fn threads_on_distinct_partitions() {
        use std::sync::Arc;
        let lock: Arc<PercptLock<u64, u64>> = Arc::new(PercptLock::new(4, |_| 0, 0));
        let handles: Vec<_> = (0..4)
            .map(|cpt| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut part = lock.lock(cpt);
                        *part += 1;
                        // current partition then default: the allowed nesting
                        *lock.lock_default() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let all = lock.lock_all();
        assert_eq!(*all.default(), 4000);
        assert!((0..4).all(|cpt| *all.part(cpt) == 1000));
    }
}
