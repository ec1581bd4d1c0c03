//! Bucket routing table.
//!
//! Peers are grouped into sub-buckets by the number of leading hash bits they
//! share with the table's center (normally the local peer). Sub-bucket `i`
//! holds peers whose first differing bit is `i`; the last sub-bucket also
//! takes every closer peer and is the only one allowed to split.
//!
//! ```text
//!  index:   0        1        2   ...   n-1 (last)
//!  shares:  0 bits   1 bit    2 bits    >= n-1 bits
//!           farthest ──────────────────► closest, splittable
//! ```
//!
//! A peer lives in exactly one sub-bucket; the `owners` map records which, so
//! lookups by id never scan the whole table.

mod bucket;

use std::collections::HashMap;

use rand::Rng as _;
use tracing::trace;

use crate::config::BucketConfig;
use crate::peer::{distance, first_different_bit, hash_peerid, Peer, PeerHash};
use bucket::SubBucket;

/// Outcome of [`RoutingTable::active_peer`].
#[derive(Debug, Default)]
pub struct ActivePeerResult {
    /// The peer was not in the table before this call.
    pub is_new: bool,
    /// The new peer did not survive the knock-out and is not in the table.
    pub discard: bool,
    /// The new peer was kept at the expense of another one.
    pub replace: bool,
    /// Peers removed to make room.
    pub evicted: Vec<Peer>,
}

pub struct RoutingTable {
    center: PeerHash,
    local_peerid: Option<String>,
    bucket_size: usize,
    bucket_count: usize,
    peer_timeout: u64,
    buckets: Vec<SubBucket>,
    owners: HashMap<String, usize>,
}

impl RoutingTable {
    /// A table centered on the local peer; the local peer itself is never stored.
    pub fn new(local_peerid: &str, config: &BucketConfig) -> Self {
        let mut table = Self::centered(
            hash_peerid(local_peerid),
            config.bucket_size,
            config.bucket_count,
        );
        table.local_peerid = Some(local_peerid.to_string());
        table.peer_timeout = config.peer_timeout.as_millis() as u64;
        table
    }

    /// A table around an arbitrary point of the keyspace.
    pub fn centered(center: PeerHash, bucket_size: usize, bucket_count: usize) -> Self {
        Self {
            center,
            local_peerid: None,
            bucket_size: bucket_size.max(1),
            bucket_count: bucket_count.max(1),
            peer_timeout: u64::MAX,
            buckets: vec![SubBucket::default()],
            owners: HashMap::new(),
        }
    }

    pub fn center(&self) -> PeerHash {
        self.center
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, |b| b.len())
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.buckets.iter().flat_map(|b| b.peers())
    }

    /// Sub-bucket a hash belongs to in the current table shape.
    pub fn index_of(&self, hash: PeerHash) -> usize {
        (first_different_bit(hash, self.center) as usize).min(self.buckets.len() - 1)
    }

    /// Sub-bucket currently holding `peerid`.
    pub fn owner_of(&self, peerid: &str) -> Option<usize> {
        self.owners.get(peerid).copied()
    }

    pub fn find_peer(&self, peerid: &str) -> Option<&Peer> {
        let idx = self.owner_of(peerid)?;
        self.buckets[idx].get(peerid)
    }

    pub fn find_peer_mut(&mut self, peerid: &str) -> Option<&mut Peer> {
        let idx = self.owner_of(peerid)?;
        self.buckets[idx].get_mut(peerid)
    }

    /// Merges or inserts `peer`, splitting and knocking out as needed.
    ///
    /// Returns `None` for the table's own peer.
    pub fn active_peer(
        &mut self,
        mut peer: Peer,
        now: u64,
        sent: bool,
        received: bool,
        trusted: bool,
    ) -> Option<ActivePeerResult> {
        if self.local_peerid.as_deref() == Some(peer.peerid()) {
            return None;
        }

        if sent {
            peer.mark_sent(now);
        }
        if received {
            peer.mark_received(now);
        }

        if let Some(existing) = self.find_peer_mut(peer.peerid()) {
            existing.update(&peer, trusted, received);
            return Some(ActivePeerResult::default());
        }

        if peer.create_time == 0 {
            peer.create_time = now;
        }

        let peerid = peer.peerid().to_string();
        let idx = self.index_of(peer.hash());
        self.buckets[idx].push(peer);
        self.owners.insert(peerid.clone(), idx);

        let mut result = ActivePeerResult {
            is_new: true,
            ..Default::default()
        };

        if self.buckets[idx].len() <= self.bucket_size {
            return Some(result);
        }

        if idx == self.buckets.len() - 1 {
            while self.last_overflows() && self.buckets.len() < self.bucket_count {
                self.split_last();
            }
        }

        for i in 0..self.buckets.len() {
            if self.buckets[i].len() > self.bucket_size {
                result.evicted.extend(self.knock_out(i, now));
            }
        }

        if self.owners.contains_key(&peerid) {
            result.replace = !result.evicted.is_empty();
        } else {
            result.discard = true;
            result.is_new = false;
            result.evicted.retain(|p| p.peerid() != peerid);
        }

        Some(result)
    }

    fn last_overflows(&self) -> bool {
        self.buckets
            .last()
            .is_some_and(|b| b.len() > self.bucket_size)
    }

    /// Moves every peer of the last sub-bucket that shares more bits with the
    /// center than its index into a newly appended sub-bucket.
    fn split_last(&mut self) {
        let last = self.buckets.len() - 1;
        let center = self.center;
        let moved = self.buckets[last]
            .drain_where(|p| first_different_bit(p.hash(), center) as usize > last);

        for peer in &moved {
            self.owners.insert(peer.peerid().to_string(), last + 1);
        }
        trace!(
            "split sub-bucket {} ({} peers moved to {})",
            last,
            moved.len(),
            last + 1
        );
        self.buckets.push(SubBucket::from_peers(moved));
    }

    /// Evicts from sub-bucket `idx` until it fits: timed-out peers first,
    /// then whichever peer was heard from least recently.
    fn knock_out(&mut self, idx: usize, now: u64) -> Vec<Peer> {
        let mut evicted = Vec::new();
        while self.buckets[idx].len() > self.bucket_size {
            let timeout = self.peer_timeout;
            let victim = self.buckets[idx]
                .least_active(|p| p.is_timeout(now, timeout))
                .or_else(|| self.buckets[idx].least_active(|_| true));

            let Some(pos) = victim else {
                break;
            };
            let peer = self.buckets[idx].remove_at(pos);
            self.owners.remove(peer.peerid());
            trace!("knocked out peer {} from sub-bucket {}", peer.peerid(), idx);
            evicted.push(peer);
        }
        evicted
    }

    pub fn remove_peer(&mut self, peerid: &str) -> Option<Peer> {
        let idx = self.owners.remove(peerid)?;
        self.buckets[idx].remove(peerid)
    }

    /// True if a peer with this id could be added without evicting anyone.
    pub fn is_expandable(&self, peerid: &str) -> bool {
        if self.owners.contains_key(peerid) {
            return true;
        }
        let idx = self.index_of(hash_peerid(peerid));
        self.buckets[idx].len() < self.bucket_size
            || (idx == self.buckets.len() - 1 && self.buckets.len() < self.bucket_count)
    }

    pub fn find_closest_peers(&self, target: PeerHash, count: usize) -> Vec<&Peer> {
        self.find_closest_peers_filtered(target, count, None, |_| true)
    }

    /// Up to `count` peers sorted by ascending XOR distance to `target`.
    ///
    /// Sub-buckets are visited in distance classes relative to the target:
    /// its own sub-bucket, then every nearer one (they all differ from the
    /// target at the same bit), then the farther ones one at a time. The scan
    /// stops at a class boundary once `count` peers are held, so the result is
    /// exact. Ties keep scan order.
    pub fn find_closest_peers_filtered(
        &self,
        target: PeerHash,
        count: usize,
        max_distance: Option<u32>,
        keep: impl Fn(&Peer) -> bool,
    ) -> Vec<&Peer> {
        let mut result: Vec<(u32, &Peer)> = Vec::with_capacity(count + 1);
        if count == 0 {
            return Vec::new();
        }

        let start = self.index_of(target);
        scan_bucket(&self.buckets[start], &mut result, target, count, max_distance, &keep);

        if result.len() < count {
            for bucket in &self.buckets[start + 1..] {
                scan_bucket(bucket, &mut result, target, count, max_distance, &keep);
            }
        }

        for bucket in self.buckets[..start].iter().rev() {
            if result.len() >= count {
                break;
            }
            scan_bucket(bucket, &mut result, target, count, max_distance, &keep);
        }

        result.into_iter().map(|(_, p)| p).collect()
    }

    /// A random sample that interleaves sub-buckets so the most populated
    /// distance rank does not dominate.
    pub fn get_random_peers(&self, count: usize, keep: impl Fn(&Peer) -> bool) -> Vec<&Peer> {
        let mut all = Vec::with_capacity(self.len());
        let mut rank = 0;
        loop {
            let mut any = false;
            for bucket in &self.buckets {
                if let Some(peer) = bucket.peers().nth(rank) {
                    any = true;
                    if keep(peer) {
                        all.push(peer);
                    }
                }
            }
            if !any {
                break;
            }
            rank += 1;
        }

        if all.len() > count {
            let start = rand::rng().random_range(0..=all.len() - count);
            all.drain(..start);
            all.truncate(count);
        }
        all
    }

    /// Removes and returns every peer that has been silent longer than the timeout.
    pub fn timeout_peers(&mut self, now: u64) -> Vec<Peer> {
        let timeout = self.peer_timeout;
        let mut removed = Vec::new();
        for bucket in &mut self.buckets {
            removed.extend(bucket.drain_where(|p| p.is_timeout(now, timeout)));
        }
        for peer in &removed {
            self.owners.remove(peer.peerid());
        }
        removed
    }

    /// Peers that have been quiet in both directions for `interval` ms,
    /// longest silence first.
    pub fn peers_to_ping(&self, now: u64, interval: u64, limit: usize) -> Vec<Peer> {
        let mut idle: Vec<&Peer> = self
            .peers()
            .filter(|p| p.is_reachable())
            .filter(|p| now.saturating_sub(p.last_active_time()) > interval)
            .filter(|p| now.saturating_sub(p.last_send_time()) > interval)
            .collect();
        idle.sort_by_key(|p| p.last_active_time());
        idle.into_iter().take(limit).cloned().collect()
    }

    pub fn touch_sent(&mut self, peerid: &str, now: u64) {
        if let Some(peer) = self.find_peer_mut(peerid) {
            peer.mark_sent(now);
        }
    }

    pub fn touch_recv(&mut self, peerid: &str, now: u64) {
        if let Some(peer) = self.find_peer_mut(peerid) {
            peer.mark_received(now);
        }
    }
}

/// Merges the peers of one sub-bucket into `result`, kept sorted by distance
/// and capped at `count`.
fn scan_bucket<'a>(
    bucket: &'a SubBucket,
    result: &mut Vec<(u32, &'a Peer)>,
    target: PeerHash,
    count: usize,
    max_distance: Option<u32>,
    keep: &impl Fn(&Peer) -> bool,
) {
    for peer in bucket.peers() {
        let dist = distance(peer.hash(), target);
        if max_distance.is_some_and(|max| dist > max) || !keep(peer) {
            continue;
        }
        let pos = result.partition_point(|(d, _)| *d <= dist);
        if pos < count {
            result.insert(pos, (dist, peer));
            result.truncate(count);
        }
    }
}

#[cfg(test)]
mod tests;
