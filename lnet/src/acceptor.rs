// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The acceptor: one listening TCP socket shared by the drivers that take
//! connections.
//!
//! A connecting peer first sends a connection request naming the nid it wants to
//! reach. The acceptor checks the request and hands the socket over to the driver of
//! that interface.

use crate::config::AcceptMode;
use crate::errors::LNetError;
use crate::lnd::LndCaps;
use crate::net::NetState;
use crate::nid::{NID_ANY, Nid};
use nix::sys::socket::{Backlog, listen};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

tracectl::trace_target!("acceptor", tracectl::LevelFilter::INFO, &["lnet", "acceptor"]);

pub const ACCEPTOR_MAGIC: u32 = 0xacce_7100;
pub const ACCEPTOR_VERSION: u32 = 1;
/// Magic of the generic LNet protocol, never valid in a connection request
pub const LNET_PROTO_MAGIC: u32 = 0x4572_6963;
/// Highest privileged port
pub const MAX_RESERVED_PORT: u16 = 1023;
/// How long a peer has to send its connection request
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after a failed accept
const ACCEPT_PAUSE: Duration = Duration::from_secs(1);

/// Protocol compatibility test flags for the next connection request
pub const PROTO_COMPAT_BAD_VERSION: u32 = 1 << 0;
pub const PROTO_COMPAT_BAD_MAGIC: u32 = 1 << 1;

/// A connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnReq {
    pub magic: u32,
    pub version: u32,
    /// The nid the peer wants to reach
    pub nid: Nid,
}

impl ConnReq {
    pub const LEN: usize = 16;

    #[must_use]
    pub fn new(nid: Nid) -> Self {
        Self {
            magic: ACCEPTOR_MAGIC,
            version: ACCEPTOR_VERSION,
            nid,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..].copy_from_slice(&self.nid.raw().to_le_bytes());
        buf
    }

    /// Read a connection request from `stream`
    ///
    /// # Errors
    ///
    /// [`LNetError::Protocol`] on anything but a connection request of our version;
    /// a peer of another version is told ours first.
    pub fn read_from(stream: &mut TcpStream) -> Result<Self, LNetError> {
        let mut word = [0; 4];
        stream.read_exact(&mut word)?;
        let swab = match u32::from_le_bytes(word) {
            ACCEPTOR_MAGIC => false,
            magic if magic == ACCEPTOR_MAGIC.swap_bytes() => true,
            magic => {
                debug!("not a connection request: magic {magic:#010x}");
                return Err(LNetError::Protocol("bad acceptor magic"));
            }
        };
        let mut rest = [0; 12];
        stream.read_exact(&mut rest)?;
        let mut version = [0; 4];
        version.copy_from_slice(&rest[..4]);
        let mut nid = [0; 8];
        nid.copy_from_slice(&rest[4..]);
        let (version, nid) = if swab {
            (u32::from_be_bytes(version), u64::from_be_bytes(nid))
        } else {
            (u32::from_le_bytes(version), u64::from_le_bytes(nid))
        };
        if version != ACCEPTOR_VERSION {
            // tell the peer what we speak; it may retry with it
            let ours = ConnReq::new(NID_ANY).encode();
            if let Err(e) = stream.write_all(&ours) {
                debug!("cannot send our version back: {e}");
            }
            return Err(LNetError::Protocol("unsupported acceptor version"));
        }
        Ok(Self {
            magic: ACCEPTOR_MAGIC,
            version,
            nid: Nid::from_raw(nid),
        })
    }
}

/// The acceptor thread
pub struct Acceptor {
    port: u16,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Acceptor {
    /// Start accepting if some interface takes connections and accepting is on.
    ///
    /// # Errors
    ///
    /// The port cannot be listened on, or the thread cannot be spawned.
    pub(crate) fn start(state: &Arc<NetState>) -> Result<Option<Self>, LNetError> {
        let mode = state.config.accept;
        if mode == AcceptMode::Disabled {
            return Ok(None);
        }
        let wanted = state
            .net
            .lock_default()
            .ni
            .iter()
            .any(|ni| ni.lnd.caps().contains(LndCaps::ACCEPT));
        if !wanted {
            return Ok(None);
        }

        let port = state.config.accept_port;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(|e| {
            error!("cannot listen on port {port}: {e}");
            LNetError::from(e)
        })?;
        let backlog = i32::try_from(state.config.accept_backlog)
            .ok()
            .and_then(|backlog| Backlog::new(backlog).ok())
            .unwrap_or(Backlog::MAXCONN);
        listen(&listener, backlog).map_err(|e| {
            error!("cannot set backlog of port {port}: {e}");
            LNetError::Io
        })?;
        let port = listener.local_addr()?.port();

        let stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(state);
        let flag = stop.clone();
        let secure = mode == AcceptMode::Secure;
        let handle = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || accept_loop(&listener, &weak, &flag, secure))
            .map_err(|e| {
                error!("failed to spawn acceptor: {e}");
                LNetError::NoMemory
            })?;
        info!("accepting connections on port {port} ({mode})");
        Ok(Some(Self {
            port,
            stop,
            handle: Some(handle),
        }))
    }

    /// The port listened on
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and wait for the thread
    pub(crate) fn finish(mut self) {
        self.stop.store(true, Ordering::Release);
        // wake up the blocked accept
        if let Err(e) = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port)) {
            debug!("cannot wake up acceptor: {e}");
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("acceptor panicked");
            }
        }
        debug!("acceptor stopped");
    }
}

fn accept_loop(listener: &TcpListener, state: &Weak<NetState>, stop: &AtomicBool, secure: bool) {
    loop {
        let accepted = listener.accept();
        if stop.load(Ordering::Acquire) {
            return;
        }
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept error: {e}, pausing");
                thread::sleep(ACCEPT_PAUSE);
                continue;
            }
        };
        let Some(state) = state.upgrade() else {
            return;
        };
        if let Err(e) = state.accept_conn(stream, peer, secure) {
            debug!("refused connection from {peer}: {e}");
        }
    }
}

impl NetState {
    /// Check a new connection and hand it to the driver of the interface it is for
    fn accept_conn(&self, mut stream: TcpStream, peer: SocketAddr, secure: bool) -> Result<(), LNetError> {
        if secure && peer.port() > MAX_RESERVED_PORT {
            warn!("refusing connection from {peer}: insecure port");
            return Err(LNetError::PermissionDenied("insecure port"));
        }
        stream.set_read_timeout(Some(ACCEPT_TIMEOUT))?;
        let req = ConnReq::read_from(&mut stream)?;
        let ni = self
            .net2ni(req.nid.net())
            .filter(|ni| ni.nid == req.nid)
            .ok_or_else(|| {
                warn!("refusing connection from {peer} for {}: no matching interface", req.nid);
                LNetError::PermissionDenied("no matching interface")
            })?;
        if !ni.lnd.caps().contains(LndCaps::ACCEPT) {
            warn!("refusing connection from {peer} for {}: no connections on this interface", req.nid);
            return Err(LNetError::PermissionDenied("interface does not take connections"));
        }
        stream.set_read_timeout(None)?;
        debug!("accepted connection from {peer} for {}", req.nid);
        ni.lnd.accept(ni.ni(), stream)
    }

    /// Connect to the acceptor of `peer` at `addr`, sending the connection request.
    /// Drivers call this to open connections.
    ///
    /// # Errors
    ///
    /// The connection fails.
    pub fn connect(&self, peer: Nid, addr: SocketAddr, timeout: Duration) -> Result<TcpStream, LNetError> {
        let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
        let mut req = ConnReq::new(peer);
        let compat = self.proto_compat.fetch_and(
            !(PROTO_COMPAT_BAD_VERSION | PROTO_COMPAT_BAD_MAGIC),
            Ordering::AcqRel,
        );
        if compat & PROTO_COMPAT_BAD_VERSION != 0 {
            req.version += 1;
        }
        if compat & PROTO_COMPAT_BAD_MAGIC != 0 {
            req.magic = LNET_PROTO_MAGIC;
        }
        stream.write_all(&req.encode())?;
        Ok(stream)
    }

    /// Make the next connection request carry a bad version or magic, for testing
    /// peers' protocol compatibility
    pub fn test_proto_compat(&self, flags: u32) {
        self.proto_compat.store(flags, Ordering::Release);
    }

    /// The port of the running acceptor
    pub fn acceptor_port(&self) -> Option<u16> {
        self.lock_acceptor().as_ref().map(Acceptor::port)
    }
}
