// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of LNet logging.
//!
//! Every module that logs declares its target once with [`trace_target!`]. Targets are
//! collected at link time and can be raised or lowered at runtime, one by one or by
//! tag, through the process-wide [`TracingControl`].

pub mod control;
pub mod display;
pub mod targets;

pub use control::{TraceCtlError, TracingControl, get_trace_ctl};
pub use tracing_subscriber::filter::LevelFilter;
