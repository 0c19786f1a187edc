// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Cookie-indexed object containers

use crate::handle::{COOKIE_TYPE_BITS, Cookie, CookieType};
use ahash::RandomState;
use std::collections::HashMap;
use tracing::error;

tracectl::trace_target!("res", tracectl::LevelFilter::INFO, &["lnet"]);

/// Objects of one type owned by one partition, indexed by cookie.
///
/// The caller holds the lock of the partition owning the container.
pub struct ResContainer<T> {
    kind: CookieType,
    next: u64,
    step: u64,
    objects: HashMap<Cookie, T, RandomState>,
}

impl<T> ResContainer<T> {
    /// A container issuing cookies of type `kind` tagged with partition `cpt`
    #[must_use]
    pub fn new(kind: CookieType, cpt: usize, cpt_bits: u32) -> Self {
        Self {
            kind,
            next: ((cpt as u64) << COOKIE_TYPE_BITS) | kind as u64,
            step: 1 << (COOKIE_TYPE_BITS + cpt_bits),
            objects: HashMap::with_hasher(RandomState::with_seed(0)),
        }
    }

    /// Store `object` under a fresh cookie.
    ///
    /// `make` receives the cookie so that the object can record its own handle.
    pub fn issue_with(&mut self, make: impl FnOnce(Cookie) -> T) -> Cookie {
        let cookie = Cookie::from_raw(self.next);
        self.next += self.step;
        self.objects.insert(cookie, make(cookie));
        cookie
    }

    /// Store `object` under a fresh cookie
    pub fn issue(&mut self, object: T) -> Cookie {
        self.issue_with(|_| object)
    }

    fn owns(&self, cookie: Cookie) -> bool {
        cookie.kind() == Some(self.kind)
    }

    #[must_use]
    pub fn get(&self, cookie: Cookie) -> Option<&T> {
        if !self.owns(cookie) {
            return None;
        }
        self.objects.get(&cookie)
    }

    pub fn get_mut(&mut self, cookie: Cookie) -> Option<&mut T> {
        if !self.owns(cookie) {
            return None;
        }
        self.objects.get_mut(&cookie)
    }

    /// Invalidate `cookie`, handing back its object
    pub fn remove(&mut self, cookie: Cookie) -> Option<T> {
        if !self.owns(cookie) {
            return None;
        }
        self.objects.remove(&cookie)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.objects.values()
    }

    /// Drop every object left, reporting the leak. Returns how many were left.
    pub fn cleanup(&mut self, what: &str) -> usize {
        let leaked = self.objects.len();
        if leaked > 0 {
            error!("{leaked} {what} still alive at cleanup");
        }
        self.objects.clear();
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn cookies_are_unique_and_decode() {
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|(cpt, bits, count): (u8, u8, u8)| {
                let bits = u32::from(bits % 9);
                let cpt = usize::from(cpt) % (1 << bits);
                let mut res: ResContainer<u32> = ResContainer::new(CookieType::Me, cpt, bits);
                let mut seen = HashSet::new();
                for i in 0..u32::from(count) {
                    let cookie = res.issue(i);
                    assert!(seen.insert(cookie));
                    assert_eq!(cookie.kind(), Some(CookieType::Me));
                    assert_eq!(cookie.cpt(bits), cpt);
                    assert_eq!(res.get(cookie), Some(&i));
                }
            });
    }

    #[test]
    fn stale_cookie_is_rejected() {
        let mut res: ResContainer<&str> = ResContainer::new(CookieType::Md, 1, 1);
        let old = res.issue("first");
        assert_eq!(res.remove(old), Some("first"));
        let new = res.issue("second");
        assert_ne!(old, new);
        assert!(res.get(old).is_none());
        assert!(res.get_mut(old).is_none());
        assert_eq!(res.get(new), Some(&"second"));
    }

    #[test]
    fn type_tag_is_checked() {
        let mut mds: ResContainer<u8> = ResContainer::new(CookieType::Md, 0, 0);
        let cookie = mds.issue(7);
        // same numeric value seen through the wrong type
        let as_me = Cookie::from_raw((cookie.raw() & !0b11) | CookieType::Me as u64);
        assert!(mds.get(as_me).is_none());
        assert_eq!(mds.cleanup("mds"), 1);
        assert!(mds.is_empty());
    }
}
