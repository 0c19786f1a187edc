// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The loopback driver: every message sent is received right away on the same
//! interface.

use super::{LNetRx, Lnd, NiSetup};
use crate::errors::LNetError;
use crate::msg::LndMsg;
use crate::ni::Ni;
use crate::nid::{LndType, NetId, Nid};
use std::sync::Arc;
use tracing::trace;

/// The loopback driver, always registered by [`crate::LNet`]
#[derive(Debug, Default, Clone, Copy)]
pub struct LoLnd;

impl Lnd for LoLnd {
    fn lnd_type(&self) -> LndType {
        LndType::Lo
    }

    fn startup(&self, ni: &mut NiSetup) -> Result<(), LNetError> {
        if ni.net != NetId::LO {
            return Err(LNetError::InvalidArgument("loopback network number must be 0"));
        }
        ni.nid = Nid::lo();
        Ok(())
    }

    fn shutdown(&self, _ni: &Ni) {}

    fn send(&self, ni: &Arc<Ni>, msg: LndMsg, rx: &dyn LNetRx) -> Result<(), LNetError> {
        trace!(
            "lo: {} {} -> {}",
            msg.hdr.body.kind(),
            msg.hdr.src,
            msg.hdr.dest
        );
        rx.parse(ni, msg)
    }
}
