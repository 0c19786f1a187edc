// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Cookies and typed handles.
//!
//! Objects handed out to API callers (memory descriptors, match entries and event
//! queues) are referenced by 64-bit cookies laid out as
//!
//! ```text
//!  63                        2 + cpt_bits   2   0
//! +----------------------------+----------+-----+
//! |          sequence          |   cpt    | type|
//! +----------------------------+----------+-----+
//! ```
//!
//! The sequence never goes back, so a cookie is never reissued for the life of the
//! process and a stale handle can only fail to resolve.

use chrono::Utc;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Bits of a cookie holding the object type
pub const COOKIE_TYPE_BITS: u32 = 2;
const COOKIE_TYPE_MASK: u64 = (1 << COOKIE_TYPE_BITS) - 1;

/// Object types encoded in cookies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CookieType {
    Md = 1,
    Me = 2,
    Eq = 3,
}

/// A raw object cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(u64);

impl Cookie {
    /// The cookie no object ever gets
    pub const INVALID: Cookie = Cookie(u64::MAX);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Cookie(raw)
    }
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
    #[must_use]
    pub fn is_invalid(self) -> bool {
        self == Cookie::INVALID
    }
    /// The object type tag, if it is a valid one
    #[must_use]
    pub fn kind(self) -> Option<CookieType> {
        match self.0 & COOKIE_TYPE_MASK {
            1 => Some(CookieType::Md),
            2 => Some(CookieType::Me),
            3 => Some(CookieType::Eq),
            _ => None,
        }
    }
    /// The owning partition, for a table of `1 << cpt_bits` partitions
    #[must_use]
    pub fn cpt(self, cpt_bits: u32) -> usize {
        let mask = (1u64 << cpt_bits) - 1;
        #[allow(clippy::cast_possible_truncation)]
        let cpt = ((self.0 >> COOKIE_TYPE_BITS) & mask) as usize;
        cpt
    }
    /// The sequence number
    #[must_use]
    pub fn sequence(self, cpt_bits: u32) -> u64 {
        self.0 >> (COOKIE_TYPE_BITS + cpt_bits)
    }
}

impl Display for Cookie {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Marker of memory descriptor handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Md;
/// Marker of match entry handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Me;
/// Marker of event queue handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Eq;

/// Object kinds that can be referenced by a [`Handle`]
pub trait HandleKind {
    const KIND: CookieType;
}
impl HandleKind for Md {
    const KIND: CookieType = CookieType::Md;
}
impl HandleKind for Me {
    const KIND: CookieType = CookieType::Me;
}
impl HandleKind for Eq {
    const KIND: CookieType = CookieType::Eq;
}

/// A handle to an object of kind `T`
pub struct Handle<T> {
    cookie: Cookie,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// The handle that never resolves
    pub const INVALID: Handle<T> = Handle::from_cookie(Cookie::INVALID);

    #[must_use]
    pub const fn from_cookie(cookie: Cookie) -> Self {
        Self {
            cookie,
            _marker: PhantomData,
        }
    }
    #[must_use]
    pub const fn cookie(&self) -> Cookie {
        self.cookie
    }
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.cookie.is_invalid()
    }
}

// manual impls: the marker type carries no bounds
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cookie == other.cookie
    }
}
impl<T> std::cmp::Eq for Handle<T> {}
impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cookie.hash(state);
    }
}
impl<T> Debug for Handle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self.cookie)
    }
}
impl<T> Display for Handle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cookie)
    }
}

/// A handle as carried in message headers: the cookie of the sending process
/// instance and the object cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireHandle {
    pub interface_cookie: u64,
    pub object_cookie: Cookie,
}

impl WireHandle {
    /// The wire handle that never resolves
    pub const NONE: WireHandle = WireHandle {
        interface_cookie: u64::MAX,
        object_cookie: Cookie::INVALID,
    };

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.object_cookie.is_invalid()
    }
}

/// An interface cookie: derived from the wall clock so that peers can tell apart
/// successive incarnations of this process
#[must_use]
pub fn interface_cookie() -> u64 {
    let now = Utc::now();
    #[allow(clippy::cast_sign_loss)]
    let secs = now.timestamp().max(0) as u64;
    secs.wrapping_mul(1_000_000) + u64::from(now.timestamp_subsec_micros())
}

/// Format a handle as `0x<cookie>`
#[must_use]
pub fn snprint_handle<T>(handle: &Handle<T>) -> String {
    format!("{:#x}", handle.cookie().raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_fields() {
        let cookie = Cookie::from_raw((5 << 4) | (2 << 2) | 1);
        assert_eq!(cookie.kind(), Some(CookieType::Md));
        assert_eq!(cookie.cpt(2), 2);
        assert_eq!(cookie.sequence(2), 5);
        assert_eq!(Cookie::from_raw(0).kind(), None);
    }

    #[test]
    fn invalid_handles() {
        let handle: Handle<Md> = Handle::INVALID;
        assert!(handle.is_invalid());
        assert_eq!(snprint_handle(&handle), "0xffffffffffffffff");
        assert!(WireHandle::NONE.is_none());
    }

    #[test]
    fn interface_cookie_moves_forward() {
        let first = interface_cookie();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(interface_cookie() > first);
    }
}
