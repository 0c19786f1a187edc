// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use lnet::acceptor::ConnReq;
use lnet::counters::Counters;
use lnet::handle::Eq;
use lnet::lnd::testing::TestLnd;
use lnet::lnd::{LNetRx, Lnd, LndCaps, NiSetup};
use lnet::md::{MdBuf, MdOptions, Unlink, UserMd};
use lnet::me::InsPos;
use lnet::msg::LndMsg;
use lnet::net::NetState;
use lnet::ni::Ni;
use lnet::nid::NID_ANY;
use lnet::transfer::AckReq;
use lnet::{
    AcceptMode, Event, EventKind, Handle, LNet, LNetConfigBuilder, LNetError, LndType, Nid, ProcessId,
};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::io::Write;
use std::net::{Ipv4Addr, TcpStream};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

fn config() -> LNetConfigBuilder {
    let mut builder = LNetConfigBuilder::default();
    builder.accept(AcceptMode::Disabled);
    builder
}

fn events(net: &NetState, eq: Handle<Eq>) -> Vec<Event> {
    std::iter::from_fn(|| net.eq_get(eq).unwrap().map(|polled| polled.into_event().unwrap())).collect()
}

#[test]
fn loopback_only() {
    let lnet = LNet::library_init(config().build().unwrap()).unwrap();
    lnet.network_up(42).unwrap();
    assert_eq!(lnet.ni_count(), 1);
    let net = lnet.net().unwrap();
    let id = lnet.get_id(0).unwrap();
    assert_eq!(id.nid, Nid::lo());
    let lo = net.nid2ni(Nid::lo()).unwrap();
    assert_eq!(lo.lnd.lnd_type(), LndType::Lo);
    drop(lo);

    lnet.network_down().unwrap();
    assert!(!lnet.is_up());
    // what the last user saw is all gone
    assert_eq!(net.ni_count(), 0);
    assert_eq!(net.peer_count_total(), 0);
    assert_eq!(lnet.lnds().refcount(LndType::Lo), 0);
    lnet.library_fini();
}

#[test]
fn second_bring_up_only_counts() {
    let lnet = LNet::library_init(config().networks("tcp").build().unwrap()).unwrap();
    let lnd = Arc::new(TestLnd::new(LndType::Sock));
    lnet.register_lnd(lnd.clone());

    lnet.network_up(42).unwrap();
    lnet.network_up(42).unwrap();
    assert_eq!(lnet.refcount(), 2);
    assert_eq!(lnd.startups(), 1);

    lnet.network_down().unwrap();
    assert_eq!(lnd.shutdowns(), 0);
    assert_eq!(lnet.ni_count(), 2);
    lnet.network_down().unwrap();
    assert_eq!(lnd.shutdowns(), 1);
    assert_eq!(lnet.ni_count(), 0);
    lnet.library_fini();
}

#[test]
fn bad_route_string_unwinds() {
    let lnet = LNet::library_init(
        config()
            .networks("tcp")
            .routes("o2ib 300 10.0.0.2@tcp")
            .build()
            .unwrap(),
    )
    .unwrap();
    let lnd = Arc::new(TestLnd::new(LndType::Sock));
    lnet.register_lnd(lnd.clone());

    let err = lnet.network_up(42).unwrap_err();
    assert_eq!(err.errno(), -22);
    assert!(!lnet.is_up());
    assert_eq!(lnet.refcount(), 0);
    assert_eq!(lnet.ni_count(), 0);
    assert_eq!(lnd.startups(), 1);
    assert_eq!(lnd.shutdowns(), 1);
    assert_eq!(lnet.lnds().refcount(LndType::Sock), 0);

    lnet.library_fini();
}

#[test]
fn obsolete_driver_refused() {
    let lnet = LNet::library_init(config().networks("vib").build().unwrap()).unwrap();
    assert_eq!(
        lnet.network_up(42),
        Err(LNetError::InvalidArgument("obsolete driver"))
    );
    assert_eq!(lnet.ni_count(), 0);
    lnet.library_fini();
}

#[test]
fn ping_self_is_repeatable() {
    let lnet = LNet::library_init(config().networks("tcp").build().unwrap()).unwrap();
    lnet.register_lnd(Arc::new(TestLnd::new(LndType::Sock)));
    lnet.network_up(42).unwrap();
    let me = lnet.get_id(0).unwrap();

    let first = lnet.ping(me, 1000, 16).unwrap();
    let second = lnet.ping(me, 1000, 16).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.nnis, 2);
    assert_eq!(first.ids[1].nid, "10.0.0.1@tcp".parse::<Nid>().unwrap());

    // only room for one
    let short = lnet.ping(me, 1000, 1).unwrap();
    assert_eq!(short.nnis, 2);
    assert_eq!(short.ids, vec![me]);

    let net = lnet.net().unwrap();
    assert!(net.counters().send_count > 0);
    net.reset_counters();
    assert_eq!(net.counters(), Counters::default());

    lnet.network_down().unwrap();
    lnet.library_fini();
}

/// A driver wired to the same driver of another instance
struct PipeLnd {
    addr: u32,
    peer: OnceLock<Weak<LNet>>,
}

impl PipeLnd {
    fn new(addr: u32) -> Self {
        Self {
            addr,
            peer: OnceLock::new(),
        }
    }
}

impl Lnd for PipeLnd {
    fn lnd_type(&self) -> LndType {
        LndType::Sock
    }

    fn startup(&self, ni: &mut NiSetup) -> Result<(), LNetError> {
        ni.nid = Nid::new(ni.net, self.addr);
        ni.peertxcredits = 8;
        ni.maxtxcredits = 256;
        Ok(())
    }

    fn shutdown(&self, _ni: &Ni) {}

    fn send(&self, _ni: &Arc<Ni>, msg: LndMsg, _rx: &dyn LNetRx) -> Result<(), LNetError> {
        let peer = self
            .peer
            .get()
            .and_then(Weak::upgrade)
            .ok_or(LNetError::HostUnreachable)?;
        let state = peer.net()?;
        let ni = state.nid2ni(msg.peer).ok_or(LNetError::HostUnreachable)?;
        state.parse(ni.ni(), msg)
    }
}

fn two_nodes() -> (Arc<LNet>, Arc<LNet>) {
    let node = |addr| {
        let lnet = Arc::new(LNet::library_init(config().networks("tcp").build().unwrap()).unwrap());
        let lnd = Arc::new(PipeLnd::new(addr));
        lnet.register_lnd(lnd.clone());
        (lnet, lnd)
    };
    let (a, a_lnd) = node(0x0a00_0001);
    let (b, b_lnd) = node(0x0a00_0002);
    a_lnd.peer.get_or_init(|| Arc::downgrade(&b));
    b_lnd.peer.get_or_init(|| Arc::downgrade(&a));
    a.network_up(0).unwrap();
    b.network_up(0).unwrap();
    (a, b)
}

fn finish(lnet: Arc<LNet>) {
    lnet.network_down().unwrap();
    if let Ok(lnet) = Arc::try_unwrap(lnet) {
        lnet.library_fini();
    }
}

#[test]
fn put_and_get_between_nodes() {
    let (a, b) = two_nodes();
    let a_net = a.net().unwrap();
    let b_net = b.net().unwrap();
    let b_id = b.get_id(1).unwrap();
    assert_eq!(b_id.nid, "10.0.0.2@tcp".parse::<Nid>().unwrap());

    // B posts a buffer on portal 10
    let b_eq = b_net.eq_alloc(8).unwrap();
    let me = b_net
        .me_attach(10, ProcessId::ANY, 0x55, 0, Unlink::Retain, InsPos::After)
        .unwrap();
    let sink = MdBuf::new(32);
    let umd = UserMd {
        buffer: sink.clone(),
        threshold: None,
        // offsets come from the initiator
        options: MdOptions::OP_PUT | MdOptions::OP_GET | MdOptions::MANAGE_REMOTE,
        eq: Some(b_eq),
        ..UserMd::default()
    };
    b_net.md_attach(me, umd, Unlink::Retain).unwrap();

    // A puts, asking for an ack; the driver delivers before the send completes
    let a_eq = a_net.eq_alloc(8).unwrap();
    let umd = UserMd {
        buffer: MdBuf::from_vec(b"hello over the pipe".to_vec()),
        threshold: Some(2),
        eq: Some(a_eq),
        ..UserMd::default()
    };
    let src = a_net.md_bind(umd, Unlink::Unlink).unwrap();
    a_net
        .put(NID_ANY, src, AckReq::Ack, b_id, 10, 0x55, 0, 7)
        .unwrap();

    let kinds: Vec<EventKind> = events(&a_net, a_eq).iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Ack, EventKind::Send]);
    let got = events(&b_net, b_eq);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].kind, EventKind::Put);
    assert_eq!(got[0].hdr_data, 7);
    assert_eq!(got[0].mlength, 19);
    assert_eq!(got[0].initiator.nid, "10.0.0.1@tcp".parse::<Nid>().unwrap());
    assert_eq!(&sink.to_vec()[..19], b"hello over the pipe");

    // and reads it back
    let into = MdBuf::new(5);
    let umd = UserMd {
        buffer: into.clone(),
        threshold: Some(2),
        eq: Some(a_eq),
        ..UserMd::default()
    };
    let dst = a_net.md_bind(umd, Unlink::Unlink).unwrap();
    a_net.get(NID_ANY, dst, b_id, 10, 0x55, 0).unwrap();
    let got = events(&a_net, a_eq);
    let kinds: Vec<EventKind> = got.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Reply, EventKind::Send]);
    assert!(got[1].unlinked);
    assert_eq!(into.to_vec(), b"hello");

    // a peer entry on each side
    assert!(a_net.debug_peer(b_id.nid).is_ok());
    assert_eq!(a_net.dist(b_id.nid).map(|d| d.dist), Ok(1));

    drop((a_net, b_net));
    finish(a);
    finish(b);
}

#[test]
fn unreachable_network() {
    let (a, b) = two_nodes();
    let a_net = a.net().unwrap();
    let eq = a_net.eq_alloc(4).unwrap();
    let umd = UserMd {
        buffer: MdBuf::from_vec(vec![1, 2, 3]),
        threshold: Some(1),
        eq: Some(eq),
        ..UserMd::default()
    };
    let md = a_net.md_bind(umd, Unlink::Unlink).unwrap();
    let far = ProcessId::new("10.9.0.1@o2ib".parse().unwrap(), 0);
    a_net.put(NID_ANY, md, AckReq::NoAck, far, 10, 0, 0, 0).unwrap();
    let got = events(&a_net, eq);
    assert_eq!(got[0].kind, EventKind::Send);
    assert_eq!(got[0].status, LNetError::HostUnreachable.errno());
    assert_eq!(
        a.dist("10.9.0.1@o2ib".parse().unwrap()).err(),
        Some(LNetError::HostUnreachable)
    );
    drop(a_net);
    finish(a);
    finish(b);
}

#[test]
#[serial]
fn acceptor_follows_the_network() {
    let lnet = LNet::library_init(
        LNetConfigBuilder::default()
            .networks("tcp")
            .accept(AcceptMode::All)
            .accept_port(0)
            .build()
            .unwrap(),
    )
    .unwrap();
    let lnd = Arc::new(TestLnd::new(LndType::Sock).with_caps(LndCaps::ACCEPT));
    lnet.register_lnd(lnd.clone());
    lnet.network_up(0).unwrap();
    let net = lnet.net().unwrap();
    let port = net.acceptor_port().unwrap();

    let nid = lnet.get_id(1).unwrap().nid;
    let mut conn = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    conn.write_all(&ConnReq::new(nid).encode()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while lnd.accepted() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(lnd.accepted(), 1);

    drop(net);
    lnet.network_down().unwrap();
    assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_err());
    assert_eq!(lnet.net().err(), Some(LNetError::NetworkDown));
    lnet.library_fini();
}
