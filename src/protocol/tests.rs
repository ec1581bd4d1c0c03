use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;

use super::*;
use crate::config::ProtocolConfig;
use crate::constants::{HEADER_LENGTH, MAGIC};
use crate::dht::ResultCode;
use crate::peer::{hash_peerid, Endpoint, PeerInfo, ServiceDescriptor, ServicePath};

fn ep(port: u16) -> Endpoint {
    Endpoint::udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)), port))
}

fn codec() -> PackageCodec {
    PackageCodec::new(&ProtocolConfig::default())
}

fn common(src: &str) -> CommonSection {
    let mut info = PeerInfo::new(src).with_endpoint(ep(4000));
    info.services.insert(
        ServicePath::parse("chat").unwrap(),
        ServiceDescriptor {
            flags: 3,
            info: BTreeMap::from([("room".to_string(), "lobby".to_string())]),
        },
    );
    info.info.insert("ver".into(), "1".into());

    CommonSection {
        src: info,
        dest_peerid: "dest".into(),
        dest_ep: Some(ep(5000)),
        nodes: vec![PeerInfo::new("n1").with_endpoint(ep(6001))],
        task_id: Some(77),
        service: ServicePath::parse("chat").unwrap(),
    }
}

fn package(body: Body) -> Package {
    let mut pkg = Package::new(body, Some(common("alice")));
    pkg.dest_hash = hash_peerid("dest");
    pkg.seq = 11;
    pkg.ack_seq = 10;
    pkg.ttl = 2;
    pkg.src_online_duration = 360;
    pkg
}

#[test]
fn test_header_layout() {
    let bytes = codec().encode(&package(Body::PingReq)).unwrap();
    assert_eq!(&bytes[0..2], &MAGIC.to_le_bytes());
    assert_eq!(&bytes[4..6], &Command::PingReq.as_u16().to_le_bytes());
    assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]) as usize, bytes.len());
    assert_eq!(&bytes[14..18], &hash_peerid("alice").to_le_bytes());
    assert_eq!(bytes[35], 2);

    let header = PackageHeader::read_from(&bytes).unwrap();
    assert_eq!(header.seq, 11);
    assert_eq!(header.ack_seq, 10);
    assert_eq!(header.src_online_duration, 360);
}

#[test]
fn test_round_trip_bodies() {
    let codec = codec();
    let bodies = vec![
        Body::FindPeerReq {
            target: "bob".into(),
        },
        Body::FindPeerResp {
            result: ResultCode::Success,
            reached: vec!["x".into(), "y".into()],
        },
        Body::UpdateValueReq {
            table: "T".into(),
            key: "K".into(),
            value: Bytes::from_static(b"\x00\x01binary"),
        },
        Body::FindValueResp {
            result: ResultCode::NotFound,
            values: BTreeMap::from([("K".to_string(), Bytes::from_static(b"V"))]),
            reached: vec![],
        },
        Body::HandshakeResp,
        Body::HoleCallReq {
            target: "t".into(),
            target_eps: vec![ep(1), ep(2)],
        },
        Body::HoleCallResp {
            result: ResultCode::Success,
            target: Some(PeerInfo::new("t").with_endpoint(ep(9))),
        },
        Body::HoleCalledReq {
            source: PeerInfo::new("s").with_endpoint(ep(8)),
        },
        Body::BroadcastEventReq {
            event: "join".into(),
            params: Bytes::from_static(b"{}"),
            origin: "alice".into(),
            event_id: 9,
            arrived: vec![1, 2, u32::MAX],
            hashbits: 4,
        },
        Body::BroadcastEventResp {
            result: ResultCode::Success,
            arrived: vec![5],
        },
        Body::PackagePieceResp { task_id: 3, no: 1 },
    ];

    for body in bodies {
        let pkg = package(body);
        let bytes = codec.encode(&pkg).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, pkg, "{:?}", pkg.command());
    }
}

#[test]
fn test_piece_payload_is_raw() {
    let codec = codec();
    let payload = Bytes::from((0..=255u8).collect::<Vec<_>>());
    let mut pkg = Package::new(
        Body::PackagePieceReq {
            task_id: 5,
            peerid: "alice".into(),
            max: 3,
            no: 2,
            payload: payload.clone(),
        },
        None,
    );
    pkg.src_hash = hash_peerid("alice");

    let bytes = codec.encode(&pkg).unwrap();
    let decoded = codec.decode(&bytes).unwrap();
    assert!(decoded.common.is_none());
    assert_eq!(decoded.src_peerid(), Some("alice"));
    match decoded.body {
        Body::PackagePieceReq { payload: p, no, .. } => {
            assert_eq!(p, payload);
            assert_eq!(no, 2);
        }
        other => panic!("unexpected body {other:?}"),
    }
}

#[test]
fn test_rejects_spoofed_hash() {
    let codec = codec();
    let mut pkg = package(Body::PingReq);
    pkg.src_hash = hash_peerid("mallory");
    let bytes = codec.encode(&pkg).unwrap();
    assert!(matches!(
        codec.decode(&bytes),
        Err(ProtocolError::HashMismatch(_))
    ));
}

#[test]
fn test_rejects_foreign_and_truncated() {
    let bytes = codec().encode(&package(Body::PingResp)).unwrap();

    let other_magic = PackageCodec::new(&ProtocolConfig {
        magic: 0x1234,
        ..Default::default()
    });
    assert!(matches!(
        other_magic.decode(&bytes),
        Err(ProtocolError::BadMagic(_))
    ));

    let other_app = PackageCodec::new(&ProtocolConfig {
        app_id: 42,
        ..Default::default()
    });
    assert!(matches!(
        other_app.decode(&bytes),
        Err(ProtocolError::ForeignApp(0))
    ));

    let other_version = PackageCodec::new(&ProtocolConfig {
        version: 2,
        ..Default::default()
    });
    assert!(matches!(
        other_version.decode(&bytes),
        Err(ProtocolError::BadVersion(1))
    ));

    assert!(matches!(
        codec().decode(&bytes[..bytes.len() - 1]),
        Err(ProtocolError::Length { .. })
    ));
    assert!(matches!(
        codec().decode(&bytes[..10]),
        Err(ProtocolError::TooShort(10))
    ));

    let mut bad_cmd = bytes.to_vec();
    bad_cmd[4] = 0x10;
    assert!(matches!(
        codec().decode(&bad_cmd),
        Err(ProtocolError::UnknownCommand(0x10))
    ));
}

#[test]
fn test_ttl_is_clamped() {
    let mut pkg = package(Body::PingReq);
    pkg.ttl = 200;
    let bytes = codec().encode(&pkg).unwrap();
    assert_eq!(bytes[35], 200);
    assert_eq!(codec().decode(&bytes).unwrap().ttl, ProtocolConfig::default().max_ttl);
}

#[test]
fn test_neighbors_trimmed_to_mtu() {
    let mut pkg = package(Body::PingReq);
    let nodes: Vec<PeerInfo> = (0..40)
        .map(|i| PeerInfo::new(format!("neighbor-{i}")).with_endpoint(ep(7000 + i)))
        .collect();
    pkg.common.as_mut().unwrap().nodes = nodes;

    let small = PackageCodec::new(&ProtocolConfig {
        mtu: 600,
        ..Default::default()
    });
    let bytes = small.encode(&pkg).unwrap();
    assert!(bytes.len() <= 600);

    let decoded = small.decode(&bytes).unwrap();
    let kept = decoded.common.unwrap().nodes;
    assert!(!kept.is_empty() && kept.len() < 40);
    assert_eq!(kept[0].peerid, "neighbor-0");
}

#[test]
fn test_combine_package() {
    let codec = codec();
    let a = codec.encode(&package(Body::PingReq)).unwrap();
    let b = codec.encode(&package(Body::HandshakeReq)).unwrap();

    let combined = codec.combine(vec![a.clone(), b.clone()]).unwrap();
    assert!(combined.len() > HEADER_LENGTH);
    let decoded = codec.decode(&combined).unwrap();
    assert!(decoded.common.is_none());
    match decoded.body {
        Body::CombinePackage { packages } => {
            assert_eq!(packages, vec![a, b]);
            assert_eq!(codec.decode(&packages[1]).unwrap().command(), Command::HandshakeReq);
        }
        other => panic!("unexpected body {other:?}"),
    }
}

#[test]
fn test_command_space() {
    assert!(!Command::FindPeerReq.is_resp());
    assert!(Command::FindPeerResp.is_resp());
    assert_eq!(Command::HoleCallReq.response(), Some(Command::HoleCallResp));
    assert_eq!(Command::PingResp.response(), None);
    assert_eq!(Command::CombinePackage.response(), None);
    assert_eq!(Command::try_from(0x63).unwrap(), Command::CombinePackage);
    assert!(Command::try_from(0x64).is_err());
}
