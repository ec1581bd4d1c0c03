use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::*;

fn ep(port: u16) -> Endpoint {
    Endpoint::udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port))
}

#[test]
fn test_hash_is_stable() {
    assert_eq!(hash_peerid("alice"), hash_peerid("alice"));
    assert_ne!(hash_peerid("alice"), hash_peerid("bob"));
    assert_eq!(Peer::new(PeerInfo::new("alice")).hash(), hash_peerid("alice"));
}

#[test]
fn test_first_different_bit() {
    assert_eq!(first_different_bit(0, 0x8000_0000), 0);
    assert_eq!(first_different_bit(0, 1), 31);
    assert_eq!(first_different_bit(0xF000_0000, 0xF800_0000), 4);
    assert_eq!(first_different_bit(7, 7), 32);
    assert_eq!(distance(0b1010, 0b0110), 0b1100);
}

#[test]
fn test_endpoint_parse() {
    let e: Endpoint = "udp@127.0.0.1:7000".parse().unwrap();
    assert_eq!(e.protocol, Protocol::Udp);
    assert_eq!(e.addr.port(), 7000);
    assert_eq!(e.to_string(), "udp@127.0.0.1:7000");

    let v6: Endpoint = "tcp@[::1]:80".parse().unwrap();
    assert_eq!(v6.protocol, Protocol::Tcp);
    assert_eq!(v6.to_string(), "tcp@[::1]:80");

    assert!("127.0.0.1:7000".parse::<Endpoint>().is_err());
    assert!("sctp@127.0.0.1:7000".parse::<Endpoint>().is_err());
    assert!("udp@nowhere".parse::<Endpoint>().is_err());
}

#[test]
fn test_service_path() {
    let path = ServicePath::parse("chat/room1").unwrap();
    assert_eq!(path.depth(), 2);
    assert_eq!(path.to_string(), "chat/room1");
    assert_eq!(path.parent().unwrap().to_string(), "chat");
    assert!(ServicePath::root().contains(&path));
    assert!(path.parent().unwrap().contains(&path));
    assert!(!path.contains(&path.parent().unwrap()));
    assert_eq!(
        path.lineage().map(|p| p.to_string()).collect::<Vec<_>>(),
        vec!["chat", "chat/room1"]
    );
    assert!(ServicePath::parse("").unwrap().is_root());
    assert!(ServicePath::parse("a//b").is_err());
    assert!(ServicePath::new(["a/b"]).is_err());
}

#[test]
fn test_validate_peerid() {
    assert!(PeerInfo::validate_peerid("p1").is_ok());
    assert!(PeerInfo::validate_peerid("").is_err());
    assert!(PeerInfo::validate_peerid(&"x".repeat(200)).is_err());
}

#[test]
fn test_update_unions_endpoints() {
    let mut peer = Peer::new(PeerInfo::new("p").with_endpoint(ep(1)));
    let newer = Peer::new(PeerInfo::new("p").with_endpoint(ep(2)));
    peer.update(&newer, false, false);
    assert_eq!(peer.eplist(), &[ep(2), ep(1)]);

    peer.update(&newer, false, false);
    assert_eq!(peer.eplist().len(), 2);
}

#[test]
fn test_trusted_update_replaces() {
    let mut peer = Peer::new(PeerInfo::new("p").with_endpoint(ep(1)));
    peer.info_mut().info.insert("old".into(), "1".into());

    let mut fresh = PeerInfo::new("p").with_endpoint(ep(3));
    fresh.info.insert("new".into(), "2".into());
    peer.update(&Peer::new(fresh), true, false);

    assert_eq!(peer.eplist(), &[ep(3)]);
    assert!(peer.additional_info().contains_key("new"));
    assert!(!peer.additional_info().contains_key("old"));
}

#[test]
fn test_services_only_from_authoritative() {
    let chat = ServicePath::parse("chat").unwrap();
    let mut peer = Peer::new(PeerInfo::new("p"));

    let mut advertised = PeerInfo::new("p");
    advertised
        .services
        .insert(chat.clone(), ServiceDescriptor::default());
    let advertised = Peer::new(advertised);

    peer.update(&advertised, false, false);
    assert!(!peer.is_member_of(&chat));

    peer.update(&advertised, false, true);
    assert!(peer.is_member_of(&chat));

    peer.update(&Peer::new(PeerInfo::new("p")), false, true);
    assert!(!peer.is_member_of(&chat));
}

#[test]
fn test_membership_includes_ancestors() {
    let mut info = PeerInfo::new("p");
    info.services
        .insert(ServicePath::parse("a/b").unwrap(), ServiceDescriptor::default());
    let peer = Peer::new(info);
    assert!(peer.is_member_of(&ServicePath::root()));
    assert!(peer.is_member_of(&ServicePath::parse("a").unwrap()));
    assert!(peer.is_member_of(&ServicePath::parse("a/b").unwrap()));
    assert!(!peer.is_member_of(&ServicePath::parse("a/c").unwrap()));
}

#[test]
fn test_destinations_prefer_address() {
    let peer = Peer::new(PeerInfo::new("p").with_endpoint(ep(1)).with_endpoint(ep(2)))
        .with_address(Some(ep(1)));
    assert_eq!(peer.destinations(), vec![ep(1), ep(2)]);
    assert!(peer.is_reachable());
    assert!(!Peer::new(PeerInfo::new("q")).is_reachable());
}

#[test]
fn test_rtt_smoothing() {
    let mut peer = Peer::new(PeerInfo::new("p"));
    peer.update_rtt(80);
    assert_eq!(peer.rtt(), 80);
    peer.update_rtt(160);
    assert_eq!(peer.rtt(), 90);
}

#[test]
fn test_timeout_counts_from_creation() {
    let mut peer = Peer::new(PeerInfo::new("p"));
    peer.create_time = 1000;
    assert!(!peer.is_timeout(1500, 1000));
    assert!(peer.is_timeout(2500, 1000));
    peer.mark_received(2400);
    assert!(!peer.is_timeout(2500, 1000));
}

#[test]
fn test_nat_type_from_u8() {
    assert_eq!(NatType::from(5), NatType::Symmetric);
    assert_eq!(NatType::from(99), NatType::Unknown);
}
