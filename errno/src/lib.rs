// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Linux errno values used on the LNet status paths.
//!
//! LNet reports failures to its callers as negative errno values. This crate keeps the
//! subset of codes the network layer and its drivers actually produce, both as plain
//! constants (positive and negated) and as a typed [`Errno`] enum.

#![cfg_attr(not(test), no_std)]
#![deny(clippy::all, clippy::pedantic, clippy::panic)]
#![forbid(unsafe_code, missing_docs)]
#![forbid(clippy::unwrap_used, clippy::expect_used, clippy::missing_errors_doc)]

/// No error, operation succeeded
pub const SUCCESS: i32 = 0;
/// Operation not permitted
pub const EPERM: i32 = 1;
/// No such file or directory (stale handle, missing entry)
pub const ENOENT: i32 = 2;
/// I/O error
pub const EIO: i32 = 5;
/// Try again
pub const EAGAIN: i32 = 11;
/// Out of memory
pub const ENOMEM: i32 = 12;
/// Bad address
pub const EFAULT: i32 = 14;
/// Device or resource busy
pub const EBUSY: i32 = 16;
/// File exists
pub const EEXIST: i32 = 17;
/// No such device
pub const ENODEV: i32 = 19;
/// Invalid argument
pub const EINVAL: i32 = 22;
/// Function not implemented
pub const ENOSYS: i32 = 38;
/// Protocol error
pub const EPROTO: i32 = 71;
/// Value too large for defined data type
pub const EOVERFLOW: i32 = 75;
/// Address already in use
pub const EADDRINUSE: i32 = 98;
/// Network is down
pub const ENETDOWN: i32 = 100;
/// Cannot send after transport endpoint shutdown
pub const ESHUTDOWN: i32 = 108;
/// Connection timed out
pub const ETIMEDOUT: i32 = 110;
/// Connection refused
pub const ECONNREFUSED: i32 = 111;
/// No route to host
pub const EHOSTUNREACH: i32 = 113;
/// Operation already in progress
pub const EALREADY: i32 = 114;

/// Operation not permitted
pub const NEG_EPERM: i32 = -EPERM;
/// No such file or directory
pub const NEG_ENOENT: i32 = -ENOENT;
/// I/O error
pub const NEG_EIO: i32 = -EIO;
/// Try again
pub const NEG_EAGAIN: i32 = -EAGAIN;
/// Out of memory
pub const NEG_ENOMEM: i32 = -ENOMEM;
/// Bad address
pub const NEG_EFAULT: i32 = -EFAULT;
/// Device or resource busy
pub const NEG_EBUSY: i32 = -EBUSY;
/// File exists
pub const NEG_EEXIST: i32 = -EEXIST;
/// No such device
pub const NEG_ENODEV: i32 = -ENODEV;
/// Invalid argument
pub const NEG_EINVAL: i32 = -EINVAL;
/// Function not implemented
pub const NEG_ENOSYS: i32 = -ENOSYS;
/// Protocol error
pub const NEG_EPROTO: i32 = -EPROTO;
/// Value too large for defined data type
pub const NEG_EOVERFLOW: i32 = -EOVERFLOW;
/// Address already in use
pub const NEG_EADDRINUSE: i32 = -EADDRINUSE;
/// Network is down
pub const NEG_ENETDOWN: i32 = -ENETDOWN;
/// Cannot send after transport endpoint shutdown
pub const NEG_ESHUTDOWN: i32 = -ESHUTDOWN;
/// Connection timed out
pub const NEG_ETIMEDOUT: i32 = -ETIMEDOUT;
/// Connection refused
pub const NEG_ECONNREFUSED: i32 = -ECONNREFUSED;
/// No route to host
pub const NEG_EHOSTUNREACH: i32 = -EHOSTUNREACH;
/// Operation already in progress
pub const NEG_EALREADY: i32 = -EALREADY;

/// Errno values known to the network layer
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted
    #[error("Operation not permitted")]
    PermissionDenied = EPERM,
    /// No such entry
    #[error("No such file or directory")]
    NoEntry = ENOENT,
    /// I/O error
    #[error("I/O error")]
    Io = EIO,
    /// Try again
    #[error("Resource temporarily unavailable")]
    Again = EAGAIN,
    /// Out of memory
    #[error("Out of memory")]
    NoMemory = ENOMEM,
    /// Bad address
    #[error("Bad address")]
    Fault = EFAULT,
    /// Device or resource busy
    #[error("Device or resource busy")]
    Busy = EBUSY,
    /// Entry exists
    #[error("File exists")]
    Exists = EEXIST,
    /// No such device
    #[error("No such device")]
    NoDevice = ENODEV,
    /// Invalid argument
    #[error("Invalid argument")]
    InvalidArgument = EINVAL,
    /// Not implemented
    #[error("Function not implemented")]
    NotImplemented = ENOSYS,
    /// Protocol error
    #[error("Protocol error")]
    Protocol = EPROTO,
    /// Value too large
    #[error("Value too large for defined data type")]
    Overflow = EOVERFLOW,
    /// Address already in use
    #[error("Address already in use")]
    AddressInUse = EADDRINUSE,
    /// Network is down
    #[error("Network is down")]
    NetworkDown = ENETDOWN,
    /// Endpoint shut down
    #[error("Cannot send after transport endpoint shutdown")]
    Shutdown = ESHUTDOWN,
    /// Timed out
    #[error("Connection timed out")]
    TimedOut = ETIMEDOUT,
    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused = ECONNREFUSED,
    /// No route to host
    #[error("No route to host")]
    HostUnreachable = EHOSTUNREACH,
    /// Already in progress
    #[error("Operation already in progress")]
    Already = EALREADY,
}

impl Errno {
    /// Parse a positive errno value.
    ///
    /// # Errors
    ///
    /// Returns the original value if it is not one of the known codes.
    pub const fn parse_i32(value: i32) -> Result<Self, i32> {
        Ok(match value {
            EPERM => Errno::PermissionDenied,
            ENOENT => Errno::NoEntry,
            EIO => Errno::Io,
            EAGAIN => Errno::Again,
            ENOMEM => Errno::NoMemory,
            EFAULT => Errno::Fault,
            EBUSY => Errno::Busy,
            EEXIST => Errno::Exists,
            ENODEV => Errno::NoDevice,
            EINVAL => Errno::InvalidArgument,
            ENOSYS => Errno::NotImplemented,
            EPROTO => Errno::Protocol,
            EOVERFLOW => Errno::Overflow,
            EADDRINUSE => Errno::AddressInUse,
            ENETDOWN => Errno::NetworkDown,
            ESHUTDOWN => Errno::Shutdown,
            ETIMEDOUT => Errno::TimedOut,
            ECONNREFUSED => Errno::ConnectionRefused,
            EHOSTUNREACH => Errno::HostUnreachable,
            EALREADY => Errno::Already,
            _ => return Err(value),
        })
    }

    /// Parse a status as returned on the legacy paths: either sign is accepted.
    ///
    /// # Errors
    ///
    /// Returns the original value for success (zero) or unknown codes.
    pub const fn parse_status(value: i32) -> Result<Self, i32> {
        match Self::parse_i32(value.wrapping_abs()) {
            Ok(errno) => Ok(errno),
            Err(_) => Err(value),
        }
    }

    /// The positive errno value
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// The negated errno value, as reported to LNet callers
    #[must_use]
    pub const fn neg(self) -> i32 {
        -(self as i32)
    }
}

impl From<Errno> for i32 {
    fn from(value: Errno) -> i32 {
        value.as_i32()
    }
}

impl TryFrom<i32> for Errno {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Errno::parse_status(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negated_constants_agree() {
        assert_eq!(Errno::NetworkDown.neg(), NEG_ENETDOWN);
        assert_eq!(Errno::InvalidArgument.neg(), NEG_EINVAL);
        assert_eq!(Errno::HostUnreachable.neg(), NEG_EHOSTUNREACH);
        assert_eq!(Errno::Protocol.as_i32(), EPROTO);
    }

    #[test]
    fn parse_either_sign() {
        assert_eq!(Errno::parse_status(NEG_ENOENT), Ok(Errno::NoEntry));
        assert_eq!(Errno::parse_status(EBUSY), Ok(Errno::Busy));
        assert_eq!(Errno::parse_status(SUCCESS), Err(SUCCESS));
        assert_eq!(Errno::parse_i32(4242), Err(4242));
        assert_eq!(Errno::try_from(-110), Ok(Errno::TimedOut));
    }
}
