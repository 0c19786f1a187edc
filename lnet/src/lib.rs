// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! LNet: NID-addressed one-sided PUT/GET messaging over pluggable network drivers.
//!
//! The process-wide state is sharded per CPU partition in two lock domains:
//!
//! * the network domain ([`ni`], [`peer`], [`counters`], [`route`]) guarded by
//!   [`net::NetState::net`], and
//! * the object domain ([`md`], [`me`], [`eq`], [`portal`] match tables) guarded by
//!   [`net::NetState::res`].
//!
//! [`api::LNet`] is the entry point. It owns the driver registry and drives the
//! `library_init` / `network_up` / `network_down` / `library_fini` lifecycle.

#![deny(clippy::all, clippy::unwrap_used, clippy::expect_used)]

pub mod acceptor;
pub mod api;
pub mod config;
pub mod counters;
pub mod cpt;
pub mod display;
pub mod eq;
pub mod errors;
pub mod handle;
pub mod lnd;
pub mod md;
pub mod me;
pub mod msg;
pub mod net;
pub mod ni;
pub mod nid;
pub mod peer;
pub mod ping;
pub mod portal;
pub mod res;
pub mod route;
pub mod router;
pub mod transfer;

pub use api::LNet;
pub use api::ctl::{CtlReply, LNetCtl};
pub use config::{AcceptMode, LNetConfig, LNetConfigBuilder};
pub use errors::{ConfigError, LNetError};
pub use handle::{Eq, Handle, Md, Me, WireHandle};
pub use msg::{Event, EventKind};
pub use nid::{LndType, NetId, Nid, ProcessId};
