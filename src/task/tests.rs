use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::broadcast::ArrivalTable;
use super::*;
use crate::config::DhtConfig;
use crate::peer::{first_different_bit, hash_peerid, Endpoint, Peer, PeerInfo, ServicePath};
use crate::protocol::{Body, CommonSection, Package, PackageCodec};
use crate::routing::RoutingTable;
use crate::send::{Oversized, PackageSender, SendOptions, Transport};
use crate::value_table::DistributedValueTable;

type Sent = Arc<Mutex<Vec<Vec<u8>>>>;

struct Recorder(Sent);

impl Transport for Recorder {
    fn send(&mut self, _dests: &[Endpoint], data: &[u8], _opts: &SendOptions) -> io::Result<()> {
        self.0.lock().push(data.to_vec());
        Ok(())
    }
}

fn ep(port: u16) -> Endpoint {
    Endpoint::udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

fn peer(id: &str, port: u16) -> Peer {
    Peer::new(PeerInfo::new(id).with_endpoint(ep(port)))
}

struct Fixture {
    config: DhtConfig,
    local: Peer,
    service: ServicePath,
    routing: RoutingTable,
    values: DistributedValueTable,
    sender: PackageSender,
    codec: PackageCodec,
    sent: Sent,
    now: u64,
}

impl Fixture {
    fn new(config: DhtConfig) -> Self {
        let local = peer("local", 4000);
        let sent = Sent::default();
        let sender = PackageSender::new(&config, Box::new(Recorder(sent.clone())), local.clone());
        Self {
            routing: RoutingTable::new(local.peerid(), &config.bucket),
            values: DistributedValueTable::new(&config.value),
            codec: PackageCodec::new(&config.protocol),
            config,
            local,
            service: ServicePath::root(),
            sender,
            sent,
            now: 1_000,
        }
    }

    fn ctx(&mut self) -> TaskContext<'_> {
        TaskContext {
            now: self.now,
            config: &self.config,
            local: &self.local,
            service: &self.service,
            routing: &mut self.routing,
            values: &mut self.values,
            sender: &mut self.sender,
        }
    }

    fn add(&mut self, id: &str, port: u16) -> Peer {
        let p = peer(id, port);
        self.routing.active_peer(p.clone(), self.now, false, true, false);
        p
    }

    /// Packages sent since the last call, decoded.
    fn take_sent(&self) -> Vec<Package> {
        self.sent
            .lock()
            .drain(..)
            .map(|data| self.codec.decode(&data).unwrap())
            .collect()
    }

    fn response(&self, from: &Peer, body: Body, task_id: u32, nodes: Vec<PeerInfo>) -> Package {
        Package::new(
            body,
            Some(CommonSection {
                src: from.info().clone(),
                dest_peerid: "local".into(),
                dest_ep: None,
                nodes,
                task_id: Some(task_id),
                service: ServicePath::root(),
            }),
        )
    }
}

fn dest_of(pkg: &Package) -> &str {
    &pkg.common.as_ref().unwrap().dest_peerid
}

#[test]
fn test_task_base_lifecycle() {
    let mut base = TaskBase::new(
        1,
        ServicePath::root(),
        100,
        Duration::from_millis(1000),
        Some(Duration::from_millis(300)),
    );
    assert_eq!(base.state(), TaskState::Created);
    assert!(base.start(100));
    assert!(!base.start(150));

    assert!(!base.is_expired(350));
    base.touch(350);
    assert!(!base.is_expired(600));
    assert!(base.is_expired(651));
    assert!(base.is_expired(1100));

    assert!(base.finish(ResultCode::Timeout));
    assert!(!base.finish(ResultCode::Success));
    assert_eq!(base.state(), TaskState::Completed);

    let mut aborted = TaskBase::new(2, ServicePath::root(), 0, Duration::from_secs(1), None);
    aborted.start(0);
    aborted.finish(ResultCode::Stopped);
    assert_eq!(aborted.state(), TaskState::Aborted);
}

#[test]
fn test_find_peer_known_locally() {
    let mut fx = Fixture::new(DhtConfig::fast());
    fx.add("bob", 5001);

    let (mut task, mut rx) = FindPeerTask::new(&fx.ctx(), 7, "bob");
    task.start(&mut fx.ctx());
    let result = rx.try_recv().unwrap();
    assert_eq!(result.result, ResultCode::Success);
    assert_eq!(result.peer.unwrap().peerid(), "bob");
    assert!(fx.take_sent().is_empty());
}

#[test]
fn test_find_peer_follows_hints() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let a = fx.add("alpha", 5001);

    let (mut task, mut rx) = FindPeerTask::new(&fx.ctx(), 7, "target");
    task.start(&mut fx.ctx());
    let sent = fx.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(dest_of(&sent[0]), "alpha");
    assert_eq!(sent[0].task_id(), Some(7));
    assert!(matches!(&sent[0].body, Body::FindPeerReq { target } if target == "target"));

    let hint = PeerInfo::new("target").with_endpoint(ep(6000));
    let resp = fx.response(
        &a,
        Body::FindPeerResp {
            result: ResultCode::NotFound,
            reached: vec!["alpha".into()],
        },
        7,
        vec![hint],
    );
    task.process(&mut fx.ctx(), &resp, &a);

    let result = rx.try_recv().unwrap();
    assert_eq!(result.result, ResultCode::Success);
    assert_eq!(result.peer.unwrap().eplist(), &[ep(6000)]);
    assert_eq!(result.reached, vec!["alpha".to_string()]);
    assert!(task.is_finished());
}

#[test]
fn test_find_peer_not_found_on_convergence() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let a = fx.add("alpha", 5001);

    let (mut task, mut rx) = FindPeerTask::new(&fx.ctx(), 3, "nobody");
    task.start(&mut fx.ctx());
    fx.take_sent();

    let resp = fx.response(
        &a,
        Body::FindPeerResp {
            result: ResultCode::NotFound,
            reached: vec![],
        },
        3,
        vec![],
    );
    task.process(&mut fx.ctx(), &resp, &a);
    let result = rx.try_recv().unwrap();
    assert_eq!(result.result, ResultCode::NotFound);
    assert_eq!(result.near_nodes.len(), 1);
    assert_eq!(fx.sender.pending_resends(), 0);
}

#[test]
fn test_self_lookup_runs_until_converged() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let a = fx.add("alpha", 5001);

    let (mut task, mut rx) = FindPeerTask::new(&fx.ctx(), 9, "local");
    task.start(&mut fx.ctx());
    assert_eq!(fx.take_sent().len(), 1);

    let hints = vec![
        PeerInfo::new("local").with_endpoint(ep(4000)),
        PeerInfo::new("beta").with_endpoint(ep(5002)),
    ];
    let resp = fx.response(
        &a,
        Body::FindPeerResp {
            result: ResultCode::NotFound,
            reached: vec![],
        },
        9,
        hints,
    );
    task.process(&mut fx.ctx(), &resp, &a);
    assert!(rx.try_recv().is_err());
    assert!(!task.is_finished());
    let sent = fx.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(dest_of(&sent[0]), "beta");

    let b = peer("beta", 5002);
    let resp = fx.response(
        &b,
        Body::FindPeerResp {
            result: ResultCode::NotFound,
            reached: vec![],
        },
        9,
        vec![],
    );
    task.process(&mut fx.ctx(), &resp, &b);
    let result = rx.try_recv().unwrap();
    assert_eq!(result.result, ResultCode::Success);
    assert!(result.peer.is_none());
    assert_eq!(result.near_nodes.len(), 2);
}

#[test]
fn test_find_peer_times_out_on_silence() {
    let mut fx = Fixture::new(DhtConfig::fast());
    fx.add("alpha", 5001);

    let (mut task, mut rx) = FindPeerTask::new(&fx.ctx(), 3, "nobody");
    task.start(&mut fx.ctx());
    for _ in 0..40 {
        fx.now += 200;
        task.tick(&mut fx.ctx());
    }
    let result = rx.try_recv().unwrap();
    assert!(matches!(
        result.result,
        ResultCode::Timeout | ResultCode::NotFound
    ));
    assert!(task.is_finished());
}

#[test]
fn test_get_value_local_hit() {
    let mut fx = Fixture::new(DhtConfig::fast());
    fx.values
        .update_value("T", "K", Bytes::from_static(b"V"), fx.now)
        .unwrap();

    let (mut task, mut rx) = GetValueTask::new(&fx.ctx(), 1, "T", "K");
    task.start(&mut fx.ctx());
    let result = rx.try_recv().unwrap();
    assert_eq!(result.result, ResultCode::Success);
    assert_eq!(result.values.get("K").unwrap(), &Bytes::from_static(b"V"));
}

#[test]
fn test_get_value_remote_precise_key() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let a = fx.add("alpha", 5001);

    let (mut task, mut rx) = GetValueTask::new(&fx.ctx(), 2, "T", "K");
    task.start(&mut fx.ctx());
    assert_eq!(fx.take_sent().len(), 1);

    let resp = fx.response(
        &a,
        Body::FindValueResp {
            result: ResultCode::Success,
            values: [("K".to_string(), Bytes::from_static(b"remote"))].into(),
            reached: vec!["alpha".into()],
        },
        2,
        vec![],
    );
    task.process(&mut fx.ctx(), &resp, &a);
    let result = rx.try_recv().unwrap();
    assert_eq!(result.result, ResultCode::Success);
    assert_eq!(result.values.len(), 1);
}

#[test]
fn test_save_value_without_peers_fails() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let (mut task, mut rx) =
        SaveValueTask::new(&fx.ctx(), 1, "T", "K", Bytes::from_static(b"V"));
    task.start(&mut fx.ctx());
    let result = rx.try_recv().unwrap();
    assert_eq!(result.result, ResultCode::Failed);
    assert!(result.reached.is_empty());
}

#[test]
fn test_save_value_reports_reached() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let a = fx.add("alpha", 5001);
    let b = fx.add("beta", 5002);

    let (mut task, mut rx) =
        SaveValueTask::new(&fx.ctx(), 4, "T", "K", Bytes::from_static(b"V"));
    task.start(&mut fx.ctx());
    let sent = fx.take_sent();
    assert_eq!(sent.len(), 2);
    assert!(sent
        .iter()
        .all(|p| matches!(&p.body, Body::UpdateValueReq { key, .. } if key == "K")));

    for from in [&a, &b] {
        let resp = fx.response(
            from,
            Body::UpdateValueResp {
                result: ResultCode::Success,
                reached: vec![from.peerid().to_string()],
            },
            4,
            vec![],
        );
        task.process(&mut fx.ctx(), &resp, from);
    }
    let result = rx.try_recv().unwrap();
    assert_eq!(result.result, ResultCode::Success);
    assert_eq!(result.reached.len(), 2);
}

#[test]
fn test_arrival_table_caps_ranks() {
    let mut table = ArrivalTable::new(0, 2);
    assert!(table.insert(0x8000_0000));
    assert!(table.insert(0x8000_0001));
    assert!(!table.insert(0x8000_0002));
    assert!(!table.insert(0x8000_0001));
    assert!(table.insert(0x4000_0000));
    assert_eq!(table.iter().count(), 3);
}

#[test]
fn test_broadcast_farthest_first_then_two_per_response() {
    let mut config = DhtConfig::fast();
    config.broadcast.flood_limit = 1;
    let mut fx = Fixture::new(config);
    let peers = [fx.add("A", 5001), fx.add("B", 5002), fx.add("C", 5003)];

    let local = fx.local.hash();
    let mut by_distance: Vec<&Peer> = peers.iter().collect();
    by_distance.sort_by_key(|p| std::cmp::Reverse(p.hash() ^ local));

    let event = BroadcastEvent {
        name: "join".into(),
        params: Bytes::from_static(b"{}"),
        origin: "local".into(),
        event_id: 9,
        service: ServicePath::root(),
    };
    let (mut task, mut rx) = BroadcastTask::emit(&fx.ctx(), 11, event, 3);
    task.start(&mut fx.ctx());

    let first = fx.take_sent();
    assert_eq!(first.len(), 1);
    assert_eq!(dest_of(&first[0]), by_distance[0].peerid());

    let resp = fx.response(
        by_distance[0],
        Body::BroadcastEventResp {
            result: ResultCode::Success,
            arrived: vec![],
        },
        11,
        vec![],
    );
    task.process(&mut fx.ctx(), &resp, by_distance[0]);
    let next: Vec<String> = fx
        .take_sent()
        .iter()
        .map(|p| dest_of(p).to_string())
        .collect();
    assert_eq!(
        next,
        vec![by_distance[1].peerid().to_string(), by_distance[2].peerid().to_string()]
    );
    assert_eq!(task.arrived_count(), 1);
    assert!(rx.try_recv().is_err());

    for p in &by_distance[1..] {
        let resp = fx.response(
            p,
            Body::BroadcastEventResp {
                result: ResultCode::Success,
                arrived: vec![],
            },
            11,
            vec![],
        );
        task.process(&mut fx.ctx(), &resp, p);
    }
    let result = rx.try_recv().unwrap();
    assert_eq!(result.arrived, 3);
    assert!(!task.is_finished());
}

#[test]
fn test_broadcast_skips_disclosed_arrivals() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let a = fx.add("A", 5001);
    let b = fx.add("B", 5002);

    let event = BroadcastEvent {
        name: "e".into(),
        params: Bytes::new(),
        origin: "A".into(),
        event_id: 1,
        service: ServicePath::root(),
    };
    let mut task = BroadcastTask::relay(&fx.ctx(), 5, event);
    let req = fx.response(
        &a,
        Body::BroadcastEventReq {
            event: "e".into(),
            params: Bytes::new(),
            origin: "A".into(),
            event_id: 1,
            arrived: vec![b.hash()],
            hashbits: 0,
        },
        99,
        vec![],
    );
    task.on_request(&mut fx.ctx(), &req, &a);
    let replies = fx.take_sent();
    assert_eq!(replies.len(), 1);
    assert!(matches!(replies[0].body, Body::BroadcastEventResp { .. }));
    assert_eq!(replies[0].task_id(), Some(99));

    task.start(&mut fx.ctx());
    assert!(fx.take_sent().is_empty());
    assert_eq!(task.arrived_count(), 2);
}

#[test]
fn test_broadcast_disclosure_narrows() {
    let mut config = DhtConfig::fast();
    config.broadcast.disclose_count = 4;
    let mut fx = Fixture::new(config);
    let event = BroadcastEvent {
        name: "e".into(),
        params: Bytes::new(),
        origin: "local".into(),
        event_id: 1,
        service: ServicePath::root(),
    };
    let (mut task, _rx) = BroadcastTask::emit(&fx.ctx(), 1, event, 1);

    let arrivals: Vec<u32> = (0..64).map(|i| hash_peerid(&format!("n{i}"))).collect();
    let sender = peer("relay", 5000);
    let req = fx.response(
        &sender,
        Body::BroadcastEventReq {
            event: "e".into(),
            params: Bytes::new(),
            origin: "local".into(),
            event_id: 1,
            arrived: arrivals,
            hashbits: 0,
        },
        1,
        vec![],
    );
    task.on_request(&mut fx.ctx(), &req, &sender);
    assert!(task.hashbits() >= 3);

    let asker = hash_peerid("asker");
    let disclosed = task.disclose(asker, 0);
    assert!(disclosed.len() <= 4);
    assert!(disclosed
        .iter()
        .all(|h| first_different_bit(*h, asker) >= task.hashbits() as u32));
    assert!(disclosed.windows(2).all(|w| (w[0] ^ asker) <= (w[1] ^ asker)));
}

#[test]
fn test_broadcast_answer_honors_requester_hashbits() {
    let mut config = DhtConfig::fast();
    config.broadcast.disclose_count = 4;
    let mut fx = Fixture::new(config);
    let event = BroadcastEvent {
        name: "e".into(),
        params: Bytes::new(),
        origin: "local".into(),
        event_id: 1,
        service: ServicePath::root(),
    };
    let (mut task, _rx) = BroadcastTask::emit(&fx.ctx(), 1, event, 1);
    fx.take_sent();

    let sender = peer("relay", 5000);
    let close: Vec<u32> = (1..4).map(|i| sender.hash() ^ i).collect();
    let mut arrivals = close.clone();
    arrivals.extend((0..64).map(|i| hash_peerid(&format!("n{i}"))));
    let req = fx.response(
        &sender,
        Body::BroadcastEventReq {
            event: "e".into(),
            params: Bytes::new(),
            origin: "local".into(),
            event_id: 1,
            arrived: arrivals,
            hashbits: 8,
        },
        1,
        vec![],
    );
    task.on_request(&mut fx.ctx(), &req, &sender);
    assert!(task.hashbits() < 8);

    let sent = fx.take_sent();
    let Body::BroadcastEventResp { arrived, .. } = &sent[0].body else {
        panic!("expected a broadcast response");
    };
    assert_eq!(arrived[..3], close[..]);
    assert!(arrived
        .iter()
        .all(|h| first_different_bit(*h, sender.hash()) >= 8));
}

#[test]
fn test_handshake_source_direct() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let target = peer("target", 6000);

    let (mut task, mut rx) = HandshakeSource::new(&fx.ctx(), 8, target.clone(), None);
    task.start(&mut fx.ctx());
    let sent = fx.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command(), crate::protocol::Command::HandshakeReq);

    let resp = fx.response(&target, Body::HandshakeResp, 8, vec![]);
    task.process(&mut fx.ctx(), &resp, &target);
    let result = rx.try_recv().unwrap();
    assert_eq!(result.result, ResultCode::Success);
}

#[test]
fn test_handshake_source_hole_calls_after_delay() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let target = peer("target", 6000);
    let agency = peer("agency", 6001);

    let (mut task, mut rx) = HandshakeSource::new(&fx.ctx(), 8, target.clone(), Some(agency.clone()));
    task.start(&mut fx.ctx());
    assert_eq!(fx.take_sent().len(), 1);

    fx.now += 250;
    task.tick(&mut fx.ctx());
    let sent = fx.take_sent();
    let call = sent
        .iter()
        .find(|p| p.command() == crate::protocol::Command::HoleCallReq)
        .unwrap();
    assert_eq!(dest_of(call), "agency");

    let seen = PeerInfo::new("target").with_endpoint(ep(7000));
    let resp = fx.response(
        &agency,
        Body::HoleCallResp {
            result: ResultCode::Success,
            target: Some(seen),
        },
        8,
        vec![],
    );
    task.process(&mut fx.ctx(), &resp, &agency);
    let again = fx.take_sent();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].command(), crate::protocol::Command::HandshakeReq);

    let req = fx.response(&target, Body::HandshakeReq, 0, vec![]);
    task.process(&mut fx.ctx(), &req, &target);
    assert_eq!(rx.try_recv().unwrap().result, ResultCode::Success);
}

#[test]
fn test_handshake_agency_answers_once() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let source = peer("source", 6000).with_address(Some(ep(6100)));
    let target = peer("target", 6001);

    let request = fx.response(
        &source,
        Body::HoleCallReq {
            target: "target".into(),
            target_eps: vec![ep(6001)],
        },
        42,
        vec![],
    );
    let mut task = HandshakeAgency::new(&fx.ctx(), 3, source.clone(), target.clone(), request.clone());
    task.start(&mut fx.ctx());
    let sent = fx.take_sent();
    assert_eq!(sent.len(), 1);
    match &sent[0].body {
        Body::HoleCalledReq { source: info } => assert_eq!(info.eplist[0], ep(6100)),
        other => panic!("unexpected body {other:?}"),
    }

    task.on_duplicate(&mut fx.ctx(), &request, &source);
    assert!(fx.take_sent().is_empty());

    let ack = fx.response(
        &target,
        Body::HoleCalledResp {
            result: ResultCode::Success,
        },
        3,
        vec![],
    );
    task.process(&mut fx.ctx(), &ack, &target);
    let answer = fx.take_sent();
    assert_eq!(answer.len(), 1);
    assert_eq!(dest_of(&answer[0]), "source");
    assert_eq!(answer[0].task_id(), Some(42));

    task.process(&mut fx.ctx(), &ack, &target);
    assert!(fx.take_sent().is_empty());
    task.on_duplicate(&mut fx.ctx(), &request, &source);
    assert_eq!(fx.take_sent().len(), 1);
}

#[test]
fn test_handshake_target_done_once() {
    let mut fx = Fixture::new(DhtConfig::fast());
    let source = peer("source", 6000);

    let mut task = HandshakeTarget::new(&fx.ctx(), 4, source.clone());
    task.start(&mut fx.ctx());
    assert_eq!(fx.take_sent().len(), 1);

    let resp = fx.response(&source, Body::HandshakeResp, 4, vec![]);
    task.process(&mut fx.ctx(), &resp, &source);
    assert!(task.is_done());
    assert!(!task.is_finished());

    fx.now += 1000;
    task.tick(&mut fx.ctx());
    assert!(fx.take_sent().is_empty());
}

#[test]
fn test_split_package_completes_on_all_acks() {
    let mut config = DhtConfig::fast();
    config.protocol.mtu = 300;
    let mut fx = Fixture::new(config);
    let dest = peer("dest", 6000);

    let data = Bytes::from(vec![7u8; 1000]);
    let oversized = Oversized {
        dest: dest.clone(),
        data: data.clone(),
        service: ServicePath::root(),
    };
    let (mut task, mut rx) = SplitPackageTask::new(&fx.ctx(), 12, oversized);
    let size = SplitPackageTask::piece_size(300, "local");
    assert_eq!(task.piece_count(), data.len().div_ceil(size));

    task.start(&mut fx.ctx());
    let pieces = fx.take_sent();
    assert_eq!(pieces.len(), task.piece_count());
    assert!(pieces.iter().all(|p| p.common.is_none()));

    for no in 0..pieces.len() as u32 {
        let ack = fx.response(&dest, Body::PackagePieceResp { task_id: 12, no }, 0, vec![]);
        task.process(&mut fx.ctx(), &ack, &dest);
    }
    assert_eq!(rx.try_recv().unwrap(), ResultCode::Success);
    assert_eq!(fx.sender.pending_resends(), 0);
}

#[test]
fn test_split_package_times_out() {
    let mut config = DhtConfig::fast();
    config.protocol.mtu = 300;
    let mut fx = Fixture::new(config);
    let oversized = Oversized {
        dest: peer("dest", 6000),
        data: Bytes::from(vec![1u8; 600]),
        service: ServicePath::root(),
    };
    let (mut task, mut rx) = SplitPackageTask::new(&fx.ctx(), 13, oversized);
    task.start(&mut fx.ctx());
    for _ in 0..60 {
        fx.now += 200;
        task.tick(&mut fx.ctx());
    }
    assert_eq!(rx.try_recv().unwrap(), ResultCode::Timeout);
}
