// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Messages and completion events.

use crate::handle::{Handle, Md, WireHandle};
use crate::nid::{Nid, ProcessId};
use bytes::Bytes;

/// Body of a message header, by message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgBody {
    Put {
        /// Where to send the ACK; [`WireHandle::NONE`] for no ACK
        ack_wmd: WireHandle,
        match_bits: u64,
        ptl_index: usize,
        /// Offset in the target buffer
        offset: usize,
        hdr_data: u64,
    },
    Get {
        /// Where to send the REPLY
        return_wmd: WireHandle,
        match_bits: u64,
        ptl_index: usize,
        src_offset: usize,
        sink_length: usize,
    },
    Reply {
        dst_wmd: WireHandle,
    },
    Ack {
        dst_wmd: WireHandle,
        match_bits: u64,
        mlength: usize,
    },
}

impl MsgBody {
    /// Name of the message type, for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MsgBody::Put { .. } => "PUT",
            MsgBody::Get { .. } => "GET",
            MsgBody::Reply { .. } => "REPLY",
            MsgBody::Ack { .. } => "ACK",
        }
    }
}

/// A message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub dest: ProcessId,
    pub src: ProcessId,
    pub body: MsgBody,
}

/// A message as handed to and from drivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LndMsg {
    pub hdr: Header,
    pub payload: Bytes,
    /// The next hop: the destination itself, or a gateway
    pub peer: Nid,
}

/// Completion event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum EventKind {
    Get,
    Put,
    Reply,
    Ack,
    Send,
    Unlink,
}

/// A completion event, delivered to the event queue of the MD involved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// The target of the operation
    pub target: ProcessId,
    /// The initiator of the operation
    pub initiator: ProcessId,
    /// The nid the message came in from (a gateway for routed messages)
    pub sender: Nid,
    pub pt_index: usize,
    pub match_bits: u64,
    /// Length requested
    pub rlength: usize,
    /// Length actually moved
    pub mlength: usize,
    pub offset: usize,
    pub md_handle: Handle<Md>,
    pub md_user_ptr: u64,
    pub hdr_data: u64,
    /// 0, or a negative errno
    pub status: i32,
    /// Last event of this MD: it is gone
    pub unlinked: bool,
    /// Position in the event queue
    pub sequence: u64,
}

impl Event {
    pub(crate) fn new(kind: EventKind, md_handle: Handle<Md>, md_user_ptr: u64) -> Self {
        Self {
            kind,
            target: ProcessId::ANY,
            initiator: ProcessId::ANY,
            sender: crate::nid::NID_ANY,
            pt_index: 0,
            match_bits: 0,
            rlength: 0,
            mlength: 0,
            offset: 0,
            md_handle,
            md_user_ptr,
            hdr_data: 0,
            status: 0,
            unlinked: false,
            sequence: 0,
        }
    }
}
