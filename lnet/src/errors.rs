// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Error types of the network layer

use errno::Errno;
use thiserror::Error;

/// Errors from parsing the configuration strings
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid network specification '{0}'")]
    Network(String),
    #[error("network '{0}' specified more than once")]
    DuplicateNetwork(String),
    #[error("invalid interface list '{0}'")]
    Interfaces(String),
    #[error("invalid partition list '{0}'")]
    CptList(String),
    #[error("invalid route '{0}'")]
    Route(String),
    #[error("invalid nid '{0}'")]
    Nid(String),
    #[error("invalid ip2nets rule '{0}'")]
    Ip2Nets(String),
    #[error("no ip2nets rule matches a local address")]
    Ip2NetsNoMatch,
    #[error("networks and ip2nets are mutually exclusive")]
    NetworksAndIp2Nets,
    #[error("invalid partition layout: {0}")]
    Partitions(String),
    #[error("invalid accept mode '{0}'")]
    AcceptMode(String),
    #[error("invalid log configuration: {0}")]
    Debug(String),
}

/// Errors returned by LNet operations.
///
/// Each variant maps to a single negative errno with [`LNetError::errno`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LNetError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no such object")]
    NotFound,
    #[error("operation not permitted: {0}")]
    PermissionDenied(&'static str),
    #[error("object busy")]
    Busy,
    #[error("network is down")]
    NetworkDown,
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("i/o error")]
    Io,
    #[error("event queue overflow")]
    Overflow,
    #[error("timed out")]
    Timeout,
    #[error("no route to host")]
    HostUnreachable,
    #[error("out of memory")]
    NoMemory,
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("driver error: {0}")]
    Driver(Errno),
}

impl LNetError {
    /// The negative errno reported for this error
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            LNetError::InvalidArgument(_) | LNetError::Config(_) => errno::NEG_EINVAL,
            LNetError::NotFound => errno::NEG_ENOENT,
            LNetError::PermissionDenied(_) => errno::NEG_EPERM,
            LNetError::Busy => errno::NEG_EBUSY,
            LNetError::NetworkDown => errno::NEG_ENETDOWN,
            LNetError::Protocol(_) => errno::NEG_EPROTO,
            LNetError::Io => errno::NEG_EIO,
            LNetError::Overflow => errno::NEG_EOVERFLOW,
            LNetError::Timeout => errno::NEG_ETIMEDOUT,
            LNetError::HostUnreachable => errno::NEG_EHOSTUNREACH,
            LNetError::NoMemory => errno::NEG_ENOMEM,
            LNetError::NotSupported(_) => errno::NEG_ENOSYS,
            LNetError::Driver(errno) => errno.neg(),
        }
    }
}

impl LNetError {
    /// The error behind a negative errno status, as carried by events
    #[must_use]
    pub fn from_status(status: i32) -> Self {
        Errno::parse_i32(status.saturating_neg()).map_or(LNetError::Io, LNetError::from)
    }
}

impl From<Errno> for LNetError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::InvalidArgument => LNetError::InvalidArgument("driver"),
            Errno::NoEntry => LNetError::NotFound,
            Errno::Busy => LNetError::Busy,
            Errno::NetworkDown => LNetError::NetworkDown,
            Errno::Io => LNetError::Io,
            Errno::HostUnreachable => LNetError::HostUnreachable,
            Errno::NoMemory => LNetError::NoMemory,
            Errno::TimedOut => LNetError::Timeout,
            other => LNetError::Driver(other),
        }
    }
}

impl From<std::io::Error> for LNetError {
    fn from(e: std::io::Error) -> Self {
        e.raw_os_error()
            .and_then(|code| Errno::parse_i32(code).ok())
            .map_or(LNetError::Io, LNetError::from)
    }
}
