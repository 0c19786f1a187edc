// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network addresses.
//!
//! A [`Nid`] is a 64-bit network address: the upper 32 bits name the network
//! ([`NetId`], itself a driver type plus an instance number) and the lower 32 bits the
//! address of the node on that network.

use crate::errors::ConfigError;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;
use strum::{Display as StrumDisplay, EnumString, FromRepr};

/// Process id presented on the wire
pub type Pid = u32;

/// Wildcard pid
pub const PID_ANY: Pid = u32::MAX;
/// Set on pids of userspace (client mode) processes
pub const PID_USERFLAG: Pid = 0x8000_0000;
/// Well-known pid of servers
pub const LUSTRE_SRV_LNET_PID: Pid = 12345;

/// Network driver types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, StrumDisplay, FromRepr)]
#[repr(u16)]
#[strum(serialize_all = "lowercase")]
pub enum LndType {
    #[strum(serialize = "elan")]
    Qsw = 1,
    #[strum(serialize = "tcp")]
    Sock = 2,
    Gm = 3,
    Ptl = 4,
    O2ib = 5,
    Cib = 6,
    #[strum(serialize = "openib")]
    OpenIb = 7,
    Iib = 8,
    Lo = 9,
    Ra = 10,
    Vib = 11,
    Mx = 12,
}

impl LndType {
    /// Types that are no longer supported and rejected at bring-up
    #[must_use]
    pub fn is_obsolete(self) -> bool {
        matches!(
            self,
            LndType::Cib | LndType::OpenIb | LndType::Iib | LndType::Vib
        )
    }

    fn ip_addressed(self) -> bool {
        matches!(
            self,
            LndType::Sock
                | LndType::O2ib
                | LndType::Cib
                | LndType::OpenIb
                | LndType::Iib
                | LndType::Vib
                | LndType::Ra
        )
    }
}

/// A network: a driver type and an instance number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetId(u32);

impl NetId {
    /// The loopback network
    pub const LO: NetId = NetId::new(LndType::Lo, 0);

    #[must_use]
    pub const fn new(lnd: LndType, num: u16) -> Self {
        NetId(((lnd as u32) << 16) | num as u32)
    }
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        NetId(raw)
    }
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
    /// The driver type, if known
    #[must_use]
    pub fn lnd(self) -> Option<LndType> {
        LndType::from_repr(self.lnd_raw())
    }
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn lnd_raw(self) -> u16 {
        (self.0 >> 16) as u16
    }
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn num(self) -> u16 {
        self.0 as u16
    }
}

impl Display for NetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.lnd() {
            Some(lnd) => write!(f, "{lnd}")?,
            None => write!(f, "<{}>", self.lnd_raw())?,
        }
        if self.num() != 0 {
            write!(f, "{}", self.num())?;
        }
        Ok(())
    }
}

impl FromStr for NetId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        let (name, num) = s.split_at(split);
        let lnd = LndType::from_str(name).map_err(|_| ConfigError::Network(s.to_string()))?;
        let num = if num.is_empty() {
            0
        } else {
            num.parse::<u16>()
                .map_err(|_| ConfigError::Network(s.to_string()))?
        };
        Ok(NetId::new(lnd, num))
    }
}

/// A network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nid(u64);

/// Wildcard nid
pub const NID_ANY: Nid = Nid(u64::MAX);

impl Nid {
    #[must_use]
    pub const fn new(net: NetId, addr: u32) -> Self {
        Nid(((net.raw() as u64) << 32) | addr as u64)
    }
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Nid(raw)
    }
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn net(self) -> NetId {
        NetId::from_raw((self.0 >> 32) as u32)
    }
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn addr(self) -> u32 {
        self.0 as u32
    }
    #[must_use]
    pub fn is_any(self) -> bool {
        self == NID_ANY
    }
    /// The loopback nid `0@lo`
    #[must_use]
    pub const fn lo() -> Self {
        Nid::new(NetId::LO, 0)
    }
}

impl Display for Nid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_any() {
            return write!(f, "<?>");
        }
        match self.net().lnd() {
            Some(lnd) if lnd.ip_addressed() => write!(f, "{}", Ipv4Addr::from(self.addr()))?,
            Some(LndType::Gm) => write!(f, "{:#x}", self.addr())?,
            _ => write!(f, "{}", self.addr())?,
        }
        write!(f, "@{}", self.net())
    }
}

impl FromStr for Nid {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(NID_ANY);
        }
        let (addr, net) = s
            .split_once('@')
            .ok_or_else(|| ConfigError::Nid(s.to_string()))?;
        let net = NetId::from_str(net).map_err(|_| ConfigError::Nid(s.to_string()))?;
        let bad = || ConfigError::Nid(s.to_string());
        let addr = match net.lnd() {
            Some(lnd) if lnd.ip_addressed() => u32::from(Ipv4Addr::from_str(addr).map_err(|_| bad())?),
            _ => match addr.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16).map_err(|_| bad())?,
                None => addr.parse::<u32>().map_err(|_| bad())?,
            },
        };
        Ok(Nid::new(net, addr))
    }
}

/// An endpoint: a nid and a pid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId {
    pub nid: Nid,
    pub pid: Pid,
}

impl ProcessId {
    /// Matches any endpoint
    pub const ANY: ProcessId = ProcessId {
        nid: NID_ANY,
        pid: PID_ANY,
    };

    #[must_use]
    pub const fn new(nid: Nid, pid: Pid) -> Self {
        Self { nid, pid }
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.pid == PID_ANY {
            write!(f, "<?>-{}", self.nid)
        } else if self.pid & PID_USERFLAG != 0 {
            write!(f, "U{}-{}", self.pid & !PID_USERFLAG, self.nid)
        } else {
            write!(f, "{}-{}", self.pid, self.nid)
        }
    }
}
