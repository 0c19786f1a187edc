// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Ping: a GET on the reserved portal that fetches the interface list of a node.
//!
//! Every node serves its ping info from an MD posted on [`RESERVED_PORTAL`]. The ping
//! info is laid out as:
//!
//! ```text
//! magic: u32 | features: u32 | pid: u32 | nnis: u32 | { nid: u64, status: u32 } * nnis
//! ```
//!
//! in the byte order of the sender; readers detect a swapped magic and swap.

use crate::errors::LNetError;
use crate::handle::{Eq, Handle, Md, Me};
use crate::md::{MdBuf, MdOptions, Unlink, UserMd};
use crate::me::InsPos;
use crate::msg::EventKind;
use crate::net::NetState;
use crate::nid::{LUSTRE_SRV_LNET_PID, NID_ANY, Nid, PID_ANY, Pid, ProcessId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::PoisonError;
use tracing::{debug, warn};

tracectl::trace_target!("ping", tracectl::LevelFilter::INFO, &["lnet", "ping"]);

pub const PING_MAGIC: u32 = 0x7069_6E67;
pub const PING_FEAT_BASE: u32 = 1 << 0;
/// The ping info carries interface statuses
pub const PING_FEAT_NI_STATUS: u32 = 1 << 1;
pub const RESERVED_PORTAL: usize = 0;
pub const PING_MATCHBITS: u64 = 0x8000_0000_0000_0000;
/// Most interfaces a ping asks for
pub const MAX_PING_IDS: usize = 20;
/// Longest a ping waits for a reply
pub const MAX_PING_TIMEOUT_MS: i32 = 500_000;
/// How long a ping waits for its MD to go once it gave up
const UNLINK_WAIT_MS: i32 = 60_000;

const HEADER_LEN: usize = 16;
const NI_LEN: usize = 12;

/// Ping info of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingInfo {
    pub features: u32,
    pub pid: Pid,
    /// Interfaces and their status
    pub nis: Vec<(Nid, u32)>,
}

impl PingInfo {
    #[must_use]
    pub fn encoded_len(nnis: usize) -> usize {
        HEADER_LEN + nnis * NI_LEN
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::encoded_len(self.nis.len()));
        buf.put_u32_le(PING_MAGIC);
        buf.put_u32_le(self.features);
        buf.put_u32_le(self.pid);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.nis.len() as u32);
        for &(nid, status) in &self.nis {
            buf.put_u64_le(nid.raw());
            buf.put_u32_le(status);
        }
        buf.freeze()
    }

    /// Decode up to `max_ids` interfaces from `data`. Returns the info and the
    /// number of interfaces the node has.
    ///
    /// # Errors
    ///
    /// [`LNetError::Protocol`] if `data` is short or not ping info.
    pub fn decode(mut data: &[u8], max_ids: usize) -> Result<(Self, usize), LNetError> {
        if data.len() < HEADER_LEN {
            return Err(LNetError::Protocol("short ping info"));
        }
        let magic = data.get_u32_le();
        let swab = match magic {
            PING_MAGIC => false,
            m if m == PING_MAGIC.swap_bytes() => true,
            _ => return Err(LNetError::Protocol("bad ping magic")),
        };
        let get_u32 = |buf: &mut &[u8]| if swab { buf.get_u32() } else { buf.get_u32_le() };
        let get_u64 = |buf: &mut &[u8]| if swab { buf.get_u64() } else { buf.get_u64_le() };
        let features = get_u32(&mut data);
        if features & PING_FEAT_NI_STATUS == 0 {
            return Err(LNetError::Protocol("ping info without interface status"));
        }
        let pid = get_u32(&mut data);
        let nnis = get_u32(&mut data) as usize;
        let count = nnis.min(max_ids);
        if data.len() < count * NI_LEN {
            return Err(LNetError::Protocol("truncated ping info"));
        }
        let nis = (0..count)
            .map(|_| {
                let nid = Nid::from_raw(get_u64(&mut data));
                (nid, get_u32(&mut data))
            })
            .collect();
        Ok((Self { features, pid, nis }, nnis))
    }
}

/// Result of a ping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResult {
    /// Interfaces of the node
    pub nnis: usize,
    /// Its first interfaces, as many as asked for
    pub ids: Vec<ProcessId>,
}

/// The MD serving our own ping info
pub struct PingTarget {
    eq: Handle<Eq>,
    me: Handle<Me>,
    md: Handle<Md>,
    buffer: MdBuf,
}

impl NetState {
    fn ping_info_local(&self) -> PingInfo {
        let shared = self.net.lock_default();
        PingInfo {
            features: PING_FEAT_BASE | PING_FEAT_NI_STATUS,
            pid: self.pid,
            nis: shared.ni.iter().map(|ni| (ni.nid, ni.status())).collect(),
        }
    }

    pub(crate) fn lock_ping_target(&self) -> concurrency::sync::MutexGuard<'_, Option<PingTarget>> {
        self.ping_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Post our ping info on the reserved portal
    pub(crate) fn ping_target_init(&self) -> Result<(), LNetError> {
        let data = self.ping_info_local().encode();
        let buffer = MdBuf::from_vec(data.to_vec());
        let eq = self.eq_alloc(2)?;
        let me = match self.me_attach(
            RESERVED_PORTAL,
            ProcessId::ANY,
            PING_MATCHBITS,
            0,
            Unlink::Unlink,
            InsPos::After,
        ) {
            Ok(me) => me,
            Err(e) => {
                self.eq_free(eq)?;
                return Err(e);
            }
        };
        let umd = UserMd {
            buffer: buffer.clone(),
            threshold: None,
            options: MdOptions::OP_GET | MdOptions::TRUNCATE | MdOptions::MANAGE_REMOTE,
            eq: Some(eq),
            ..UserMd::default()
        };
        let md = match self.md_attach(me, umd, Unlink::Retain) {
            Ok(md) => md,
            Err(e) => {
                self.me_unlink(me)?;
                self.eq_free(eq)?;
                return Err(e);
            }
        };
        debug!("ping target up: {} byte(s) of ping info", buffer.len());
        *self.lock_ping_target() = Some(PingTarget {
            eq,
            me,
            md,
            buffer,
        });
        Ok(())
    }

    /// Withdraw the ping info, waiting for the MD to go
    pub(crate) fn ping_target_fini(&self) {
        let Some(target) = self.lock_ping_target().take() else {
            return;
        };
        if let Err(e) = self.md_unlink(target.md) {
            warn!("ping MD {} already gone: {e}", target.md);
        }
        let mut timeout_ms = 1000;
        loop {
            match self.eq_poll(&[target.eq], timeout_ms) {
                Ok(Some(polled)) if polled.event.unlinked => break,
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!("still waiting for ping MD {} to unlink", target.md);
                    timeout_ms = timeout_ms.saturating_mul(2);
                }
                Err(e) => {
                    warn!("cannot wait for ping MD {}: {e}", target.md);
                    break;
                }
            }
        }
        if self.me_unlink(target.me).is_ok() {
            debug!("ping ME {} outlived its MD", target.me);
        }
        if let Err(e) = self.eq_free(target.eq) {
            warn!("cannot free ping EQ: {e}");
        }
    }

    /// Refresh the interface statuses in our ping info
    pub(crate) fn ping_target_refresh(&self) {
        let data = self.ping_info_local().encode();
        let target = self.lock_ping_target();
        let Some(target) = target.as_ref() else {
            return;
        };
        if data.len() != target.buffer.len() {
            warn!("interface list changed under the ping target");
            return;
        }
        target.buffer.write(0, &data);
    }

    /// Ping `target`, returning its ping info and its number of interfaces
    pub(crate) fn ping_info(
        &self,
        target: ProcessId,
        timeout_ms: i32,
        max_ids: usize,
    ) -> Result<(PingInfo, usize), LNetError> {
        if max_ids == 0 || max_ids > MAX_PING_IDS {
            return Err(LNetError::InvalidArgument("bad number of ping ids"));
        }
        if target.nid == NID_ANY {
            return Err(LNetError::InvalidArgument("cannot ping any nid"));
        }
        if timeout_ms > MAX_PING_TIMEOUT_MS {
            return Err(LNetError::InvalidArgument("ping timeout too long"));
        }
        let target = if target.pid == PID_ANY {
            ProcessId::new(target.nid, LUSTRE_SRV_LNET_PID)
        } else {
            target
        };

        let eq = self.eq_alloc(2)?;
        let buffer = MdBuf::new(PingInfo::encoded_len(max_ids));
        let umd = UserMd {
            buffer: buffer.clone(),
            threshold: Some(2),
            options: MdOptions::TRUNCATE,
            eq: Some(eq),
            ..UserMd::default()
        };
        let md = match self.md_bind(umd, Unlink::Unlink) {
            Ok(md) => md,
            Err(e) => {
                self.eq_free(eq)?;
                return Err(e);
            }
        };
        if let Err(e) = self.get(NID_ANY, md, target, RESERVED_PORTAL, PING_MATCHBITS, 0) {
            self.md_unlink(md)?;
            self.eq_free(eq)?;
            return Err(e);
        }

        let mut replied = None;
        let mut failure = None;
        let mut unlinked = false;
        let mut timeout_ms = timeout_ms;
        loop {
            let polled = match self.eq_poll(&[eq], timeout_ms) {
                Ok(polled) => polled,
                Err(e) => {
                    failure.get_or_insert(e);
                    break;
                }
            };
            let failed = match &polled {
                None => Some(LNetError::Timeout),
                Some(p) if p.event.status != 0 => Some(LNetError::from_status(p.event.status)),
                Some(_) => None,
            };
            if let Some(e) = failed {
                if replied.is_none() {
                    failure.get_or_insert(e);
                }
                if !unlinked {
                    // make sure the MD goes in finite time
                    if let Err(e) = self.md_unlink(md) {
                        debug!("ping {target}: MD already gone: {e}");
                    }
                    unlinked = true;
                    timeout_ms = UNLINK_WAIT_MS;
                } else if polled.is_none() {
                    // the MD must be gone before its buffer is reused
                    warn!("ping {target}: late network completion, still waiting for the MD to unlink");
                }
            } else if let Some(p) = &polled {
                if p.event.kind == EventKind::Reply {
                    replied = Some(p.event.mlength);
                }
            }
            if polled.is_some_and(|p| p.event.unlinked) {
                break;
            }
        }
        if let Err(e) = self.eq_free(eq) {
            warn!("ping {target}: cannot free EQ: {e}");
        }

        let Some(nob) = replied else {
            return Err(failure.unwrap_or(LNetError::Io));
        };
        let data = buffer.read(0, nob);
        let (info, nnis) = PingInfo::decode(&data, max_ids).inspect_err(|e| {
            warn!("{target}: bad ping reply: {e}");
        })?;
        if info.pid != target.pid {
            warn!("{target}: ping reply from pid {}", info.pid);
            return Err(LNetError::Protocol("ping reply from another process"));
        }
        Ok((info, nnis))
    }

    /// Ping `target`: how many interfaces it has, and the first `max_ids` of them
    ///
    /// # Errors
    ///
    /// [`LNetError::InvalidArgument`] on bad arguments, [`LNetError::Timeout`] or
    /// [`LNetError::Io`] without a reply, [`LNetError::Protocol`] on a bad reply.
    pub fn ping(&self, target: ProcessId, timeout_ms: i32, max_ids: usize) -> Result<PingResult, LNetError> {
        let (info, nnis) = self.ping_info(target, timeout_ms, max_ids)?;
        let pid = info.pid;
        Ok(PingResult {
            nnis,
            ids: info
                .nis
                .into_iter()
                .map(|(nid, _)| ProcessId::new(nid, pid))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ni::NI_STATUS_UP;
    use crate::transfer::tests::running_state;
    use pretty_assertions::assert_eq;

    fn info() -> PingInfo {
        PingInfo {
            features: PING_FEAT_BASE | PING_FEAT_NI_STATUS,
            pid: 12345,
            nis: vec![
                (Nid::lo(), NI_STATUS_UP),
                ("10.0.0.1@tcp".parse().unwrap(), NI_STATUS_UP),
                ("10.0.0.2@tcp".parse().unwrap(), 0xdead_face),
            ],
        }
    }

    #[test]
    fn decode_limits_and_checks() {
        let data = info().encode();
        assert_eq!(data.len(), PingInfo::encoded_len(3));
        let (decoded, nnis) = PingInfo::decode(&data, 2).unwrap();
        assert_eq!(nnis, 3);
        assert_eq!(decoded.nis, info().nis[..2].to_vec());
        assert!(PingInfo::decode(&data[..HEADER_LEN - 1], 2).is_err());
        assert!(PingInfo::decode(&data[..HEADER_LEN + NI_LEN], 2).is_err());
        let mut bad = data.to_vec();
        bad[0] ^= 0xff;
        assert_eq!(
            PingInfo::decode(&bad, 2),
            Err(LNetError::Protocol("bad ping magic"))
        );
        let mut old = info();
        old.features = PING_FEAT_BASE;
        assert!(PingInfo::decode(&old.encode(), 2).is_err());
    }

    #[test]
    fn decode_swapped() {
        let info = info();
        let mut buf = BytesMut::new();
        for word in [PING_MAGIC, info.features, info.pid, 3] {
            buf.put_u32(word);
        }
        for &(nid, status) in &info.nis {
            buf.put_u64(nid.raw());
            buf.put_u32(status);
        }
        assert_eq!(PingInfo::decode(&buf, 20).unwrap(), (info, 3));
    }

    #[test]
    fn ping_arguments() {
        let (state, _, ni) = running_state(1);
        let target = ProcessId::new(ni.nid, 42);
        for (target, timeout, ids) in [
            (target, 1000, 0),
            (target, 1000, MAX_PING_IDS + 1),
            (ProcessId::ANY, 1000, 4),
            (target, MAX_PING_TIMEOUT_MS + 1, 4),
        ] {
            assert!(matches!(
                state.ping(target, timeout, ids),
                Err(LNetError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn ping_self() {
        let (state, _, ni) = running_state(1);
        state.ping_target_init().unwrap();
        let result = state.ping(ProcessId::new(ni.nid, 42), 1000, 1).unwrap();
        assert_eq!(result.nnis, 2);
        assert_eq!(result.ids, vec![ProcessId::new(Nid::lo(), 42)]);

        // the pid defaults to the server's
        assert_eq!(
            state.ping(ProcessId::new(ni.nid, PID_ANY), 1000, 4),
            Err(LNetError::Protocol("ping reply from another process"))
        );

        ni.set_status(0xdead_face);
        state.ping_target_refresh();
        let (info, _) = state.ping_info(ProcessId::new(ni.nid, 42), 1000, 4).unwrap();
        assert_eq!(info.nis[1], (ni.nid, 0xdead_face));

        state.ping_target_fini();
        assert!(state.lock_ping_target().is_none());
        assert!(state.res.lock_default().eqs.values().next().is_none());
    }

    #[test]
    fn ping_without_reply() {
        let (state, lnd, _) = running_state(1);
        let peer = ProcessId::new("10.0.0.7@tcp".parse().unwrap(), 42);
        assert_eq!(state.ping(peer, 10, 4), Err(LNetError::Timeout));
        assert_eq!(lnd.sent().len(), 1);
        // the wait ended on the unlink event, and nothing is left behind
        assert!(state.res.lock_default().eqs.values().next().is_none());
        lnd.fail_send(true);
        assert_eq!(state.ping(peer, 10, 4), Err(LNetError::Io));
    }
}
