use std::collections::HashSet;
use std::time::Duration;

use super::*;
use crate::peer::PeerInfo;

fn peer(id: &str) -> Peer {
    Peer::new(PeerInfo::new(id))
}

/// Ids whose hash shares exactly `bits` leading bits with `center`.
fn ids_at(center: PeerHash, bits: u32, count: usize) -> Vec<String> {
    (0..)
        .map(|i| format!("peer-{bits}-{i}"))
        .filter(|id| first_different_bit(hash_peerid(id), center) == bits)
        .take(count)
        .collect()
}

fn assert_shape(table: &RoutingTable, size: usize) {
    let last = table.bucket_count() - 1;
    let mut total = 0;
    for i in 0..table.bucket_count() {
        assert!(table.bucket_len(i) <= size, "sub-bucket {i} overflows");
        total += table.bucket_len(i);
    }
    assert_eq!(total, table.len());

    for p in table.peers() {
        let bits = first_different_bit(p.hash(), table.center()) as usize;
        let idx = table.owner_of(p.peerid()).unwrap();
        if idx == last {
            assert!(bits >= last);
        } else {
            assert_eq!(bits, idx);
        }
    }
}

#[test]
fn test_insert_and_update() {
    let mut table = RoutingTable::centered(0, 8, 16);
    let result = table.active_peer(peer("a"), 10, false, true, false).unwrap();
    assert!(result.is_new);
    assert!(!result.discard);

    let result = table.active_peer(peer("a"), 20, false, true, false).unwrap();
    assert!(!result.is_new);
    assert_eq!(table.len(), 1);
    assert_eq!(table.find_peer("a").unwrap().last_recv_time(), 20);
    assert_eq!(table.find_peer("a").unwrap().create_time, 10);
}

#[test]
fn test_never_stores_self() {
    let mut table = RoutingTable::new("me", &BucketConfig::default());
    assert!(table.active_peer(peer("me"), 1, false, true, true).is_none());
    assert!(table.is_empty());
}

#[test]
fn test_split_keeps_shape() {
    let mut table = RoutingTable::centered(hash_peerid("center"), 2, 6);
    for i in 0..300 {
        table.active_peer(peer(&format!("n{i}")), i + 1, false, true, false);
        assert_shape(&table, 2);
    }
    assert_eq!(table.bucket_count(), 6);
}

#[test]
fn test_full_bucket_evicts_least_recent() {
    let center = 0;
    let ids = ids_at(center, 0, 3);
    let mut table = RoutingTable::centered(center, 2, 1);

    table.active_peer(peer(&ids[0]), 100, false, true, false);
    table.active_peer(peer(&ids[1]), 200, false, true, false);
    let result = table
        .active_peer(peer(&ids[2]), 300, false, true, false)
        .unwrap();

    assert!(result.is_new);
    assert!(result.replace);
    assert_eq!(result.evicted.len(), 1);
    assert_eq!(result.evicted[0].peerid(), ids[0]);
    assert!(table.find_peer(&ids[0]).is_none());
    assert!(table.find_peer(&ids[2]).is_some());
}

#[test]
fn test_unverified_hint_is_discarded() {
    let center = 0;
    let ids = ids_at(center, 0, 3);
    let mut table = RoutingTable::centered(center, 2, 1);

    table.active_peer(peer(&ids[0]), 100, false, true, false);
    table.active_peer(peer(&ids[1]), 200, false, true, false);
    let result = table
        .active_peer(peer(&ids[2]), 300, false, false, false)
        .unwrap();

    assert!(result.discard);
    assert!(!result.is_new);
    assert!(result.evicted.is_empty());
    assert_eq!(table.len(), 2);
}

#[test]
fn test_timed_out_peer_goes_first() {
    let config = BucketConfig {
        bucket_size: 2,
        bucket_count: 1,
        peer_timeout: Duration::from_millis(1000),
        ..Default::default()
    };
    let mut table = RoutingTable::new("me", &config);

    table.active_peer(peer("a"), 1500, false, true, false);
    table.active_peer(peer("b"), 10, false, true, false);
    let result = table.active_peer(peer("c"), 2000, false, true, false).unwrap();

    assert_eq!(result.evicted.len(), 1);
    assert_eq!(result.evicted[0].peerid(), "b");
}

#[test]
fn test_find_closest_is_exact() {
    let mut table = RoutingTable::centered(hash_peerid("origin"), 4, 16);
    for i in 0..400 {
        table.active_peer(peer(&format!("x{i}")), i + 1, false, true, false);
    }

    for target in ["t1", "t2", "t3", "origin"].map(hash_peerid) {
        let mut all: Vec<&Peer> = table.peers().collect();
        all.sort_by_key(|p| p.hash() ^ target);
        let expected: Vec<&str> = all.iter().take(8).map(|p| p.peerid()).collect();

        let got: Vec<&str> = table
            .find_closest_peers(target, 8)
            .iter()
            .map(|p| p.peerid())
            .collect();
        assert_eq!(got, expected);
    }
}

#[test]
fn test_find_closest_filters() {
    let mut table = RoutingTable::centered(0, 8, 16);
    for i in 0..50 {
        table.active_peer(peer(&format!("f{i}")), 1, false, true, false);
    }
    let target = hash_peerid("target");

    let limit = u32::MAX / 4;
    let close = table.find_closest_peers_filtered(target, 50, Some(limit), |_| true);
    assert!(close.iter().all(|p| p.hash() ^ target <= limit));

    let skip = table.find_closest_peers(target, 1)[0].peerid().to_string();
    let rest = table.find_closest_peers_filtered(target, 5, None, |p| p.peerid() != skip);
    assert_eq!(rest.len(), 5);
    assert!(rest.iter().all(|p| p.peerid() != skip));

    assert!(table.find_closest_peers(target, 0).is_empty());
}

#[test]
fn test_random_peers() {
    let mut table = RoutingTable::centered(0, 8, 16);
    for i in 0..40 {
        table.active_peer(peer(&format!("r{i}")), 1, false, true, false);
    }

    let sample = table.get_random_peers(10, |_| true);
    assert_eq!(sample.len(), 10);
    let unique: HashSet<&str> = sample.iter().map(|p| p.peerid()).collect();
    assert_eq!(unique.len(), 10);

    let all = table.get_random_peers(1000, |_| true);
    assert_eq!(all.len(), table.len());

    let none = table.get_random_peers(10, |_| false);
    assert!(none.is_empty());
}

#[test]
fn test_is_expandable() {
    let center = 0;
    let far = ids_at(center, 0, 3);
    let mut table = RoutingTable::centered(center, 2, 1);
    assert!(table.is_expandable(&far[0]));

    table.active_peer(peer(&far[0]), 1, false, true, false);
    table.active_peer(peer(&far[1]), 1, false, true, false);
    assert!(!table.is_expandable(&far[2]));
    assert!(table.is_expandable(&far[0]));
}

#[test]
fn test_timeout_and_remove() {
    let config = BucketConfig {
        peer_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let mut table = RoutingTable::new("me", &config);
    table.active_peer(peer("old"), 10, false, true, false);
    table.active_peer(peer("new"), 500, false, true, false);

    let gone = table.timeout_peers(550);
    assert_eq!(gone.len(), 1);
    assert_eq!(gone[0].peerid(), "old");
    assert!(table.owner_of("old").is_none());

    assert!(table.remove_peer("new").is_some());
    assert!(table.remove_peer("new").is_none());
    assert!(table.is_empty());
}
