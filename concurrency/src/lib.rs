// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Synchronization primitives for the network layer.
//!
//! [`sync`] resolves to `std::sync`, or to the `loom`/`shuttle` model checkers when the
//! matching feature is enabled, so that every lock in the workspace can be exercised
//! under a scheduler that explores interleavings.
//!
//! [`percpt`] provides the partitioned lock that shards state per CPU partition.

#![deny(
    unsafe_code,
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

#[cfg(all(feature = "loom", feature = "shuttle"))]
compile_error!("Cannot enable both 'loom' and 'shuttle' features at the same time");

#[cfg(not(any(feature = "loom", feature = "shuttle")))]
pub use std::sync;

#[cfg(feature = "loom")]
pub use loom::sync;

#[cfg(feature = "shuttle")]
pub use shuttle::sync;

#[cfg(not(any(feature = "loom", feature = "shuttle")))]
pub use std::thread;

#[cfg(feature = "loom")]
pub use loom::thread;

#[cfg(feature = "shuttle")]
pub use shuttle::thread;

pub mod percpt;

pub use percpt::{AllGuard, PartGuard, PercptLock};
