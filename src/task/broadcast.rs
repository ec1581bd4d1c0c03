//! Epidemic flooding of broadcast events.
//!
//! A broadcast task sends the event to the known peers of its service,
//! farthest first, starting with `flood_limit` requests and releasing two
//! more for every response. Every request and response carries a sample of
//! peers known to have been reached, chosen close to the receiver, so the
//! receiver can skip them. The sample grows more local (`hashbits` leading
//! bits shared with the receiver) as the reached set grows.
//!
//! The task never completes on coverage: it stays alive to answer late
//! duplicates until its deadline.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::{Completion, Task, TaskBase, TaskContext};
use crate::constants::HASH_BIT_COUNT;
use crate::dht::ResultCode;
use crate::peer::{distance, first_different_bit, Peer, PeerHash, ServicePath};
use crate::protocol::{Body, Package};
use crate::send::{ResendId, ResendState};

/// An event as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastEvent {
    pub name: String,
    pub params: Bytes,
    pub origin: String,
    pub event_id: u32,
    pub service: ServicePath,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    pub result: ResultCode,
    /// Peers confirmed reached, the emitter excluded.
    pub arrived: usize,
}

/// Reached hashes bucketed by distance rank from a center, at most `cap`
/// per rank. Two of these, one centered on the local hash and one on its
/// complement, keep a sample of arrivals spread over the whole key space.
#[derive(Debug)]
pub(crate) struct ArrivalTable {
    center: PeerHash,
    cap: usize,
    ranks: Vec<Vec<PeerHash>>,
}

impl ArrivalTable {
    pub fn new(center: PeerHash, cap: usize) -> Self {
        Self {
            center,
            cap: cap.max(1),
            ranks: vec![Vec::new(); HASH_BIT_COUNT as usize + 1],
        }
    }

    pub fn insert(&mut self, hash: PeerHash) -> bool {
        let rank = &mut self.ranks[first_different_bit(hash, self.center) as usize];
        if rank.len() >= self.cap || rank.contains(&hash) {
            return false;
        }
        rank.push(hash);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = PeerHash> + '_ {
        self.ranks.iter().flatten().copied()
    }
}

#[derive(Debug)]
struct InFlight {
    peer: Peer,
    id: Option<ResendId>,
    since: u64,
}

pub struct BroadcastTask {
    base: TaskBase,
    event: BroadcastEvent,
    local_hash: PeerHash,
    pending: VecDeque<Peer>,
    in_flight: Vec<InFlight>,
    retry_cursor: usize,
    contacted: HashSet<String>,
    arrived: HashSet<PeerHash>,
    near: ArrivalTable,
    far: ArrivalTable,
    hashbits: u8,
    min_arrivals: usize,
    flood_limit: usize,
    retry_batch: usize,
    disclose_count: usize,
    tx: Option<oneshot::Sender<BroadcastResult>>,
}

impl BroadcastTask {
    /// A broadcast started by the local application. The handle fires once
    /// `min_arrivals` peers were reached, or at the deadline.
    pub fn emit(
        ctx: &TaskContext<'_>,
        id: u32,
        event: BroadcastEvent,
        min_arrivals: usize,
    ) -> (Self, Completion<BroadcastResult>) {
        let (tx, rx) = oneshot::channel();
        let mut task = Self::with_event(ctx, id, event);
        task.min_arrivals = min_arrivals;
        task.tx = Some(tx);
        (task, rx)
    }

    /// A broadcast continued on behalf of the peer that delivered it.
    pub fn relay(ctx: &TaskContext<'_>, id: u32, event: BroadcastEvent) -> Self {
        Self::with_event(ctx, id, event)
    }

    fn with_event(ctx: &TaskContext<'_>, id: u32, event: BroadcastEvent) -> Self {
        let local_hash = ctx.local.hash();
        let config = &ctx.config.broadcast;
        let mut task = Self {
            base: TaskBase::new(id, ctx.service.clone(), ctx.now, config.timeout, None),
            event,
            local_hash,
            pending: VecDeque::new(),
            in_flight: Vec::new(),
            retry_cursor: 0,
            contacted: HashSet::from([ctx.local.peerid().to_string()]),
            arrived: HashSet::new(),
            near: ArrivalTable::new(local_hash, config.disclose_count),
            far: ArrivalTable::new(!local_hash, config.disclose_count),
            hashbits: 0,
            min_arrivals: 0,
            flood_limit: config.flood_limit.max(1),
            retry_batch: config.retry_batch.max(1),
            disclose_count: config.disclose_count.max(1),
            tx: None,
        };
        task.mark_arrived(local_hash);
        task
    }

    pub fn event(&self) -> &BroadcastEvent {
        &self.event
    }

    /// `(origin, event id)`, the identity of the broadcast.
    pub fn key(&self) -> (String, u32) {
        (self.event.origin.clone(), self.event.event_id)
    }

    /// Peers confirmed reached, the local peer excluded.
    pub fn arrived_count(&self) -> usize {
        self.arrived.len().saturating_sub(1)
    }

    pub fn hashbits(&self) -> u8 {
        self.hashbits
    }

    /// Handles a delivery of this broadcast: merges what the sender knows,
    /// then answers with the arrivals closest to it.
    pub fn on_request(&mut self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        let Body::BroadcastEventReq {
            arrived, hashbits, ..
        } = &pkg.body
        else {
            return;
        };
        self.base.touch(ctx.now);
        self.mark_arrived(from.hash());
        for hash in arrived {
            self.mark_arrived(*hash);
        }
        self.settle(ctx, from.peerid());

        let body = Body::BroadcastEventResp {
            result: ResultCode::Success,
            arrived: self.disclose(from.hash(), *hashbits),
        };
        ctx.reply(from, pkg, body);
        self.check_emitted();
    }

    fn mark_arrived(&mut self, hash: PeerHash) {
        if !self.arrived.insert(hash) {
            return;
        }
        self.near.insert(hash);
        self.far.insert(hash);

        let ratio = self.arrived.len() / self.disclose_count;
        if ratio > 1 {
            self.hashbits = ratio.ilog2().min(HASH_BIT_COUNT - 1) as u8;
        }
    }

    /// Arrivals sharing at least `hashbits` leading bits with `asker`, or
    /// `min_bits` if the asker is already narrower, nearest first.
    pub fn disclose(&self, asker: PeerHash, min_bits: u8) -> Vec<PeerHash> {
        let bits = self.hashbits.max(min_bits) as u32;
        let mut sample: Vec<PeerHash> = self
            .near
            .iter()
            .chain(self.far.iter())
            .filter(|h| *h != asker && first_different_bit(*h, asker) >= bits)
            .collect();
        sample.sort_by_key(|h| (distance(*h, asker), *h));
        sample.dedup();
        sample.truncate(self.disclose_count);
        sample
    }

    /// Drops an in-flight request to `peerid` once it is known reached.
    fn settle(&mut self, ctx: &mut TaskContext<'_>, peerid: &str) -> bool {
        let Some(pos) = self.in_flight.iter().position(|f| f.peer.peerid() == peerid) else {
            return false;
        };
        let flight = self.in_flight.remove(pos);
        if let Some(id) = flight.id {
            ctx.sender.cancel(id);
        }
        if self.retry_cursor > pos {
            self.retry_cursor -= 1;
        }
        true
    }

    /// Queues members of the routing table not contacted yet, farthest first.
    fn collect_pending(&mut self, ctx: &TaskContext<'_>) {
        let mut fresh: Vec<Peer> = ctx
            .routing
            .peers()
            .filter(|p| p.is_reachable() && p.is_member_of(ctx.service))
            .filter(|p| !self.contacted.contains(p.peerid()))
            .cloned()
            .collect();
        let local = self.local_hash;
        fresh.sort_by_key(|p| std::cmp::Reverse(distance(p.hash(), local)));
        for peer in fresh {
            self.contacted.insert(peer.peerid().to_string());
            self.pending.push_back(peer);
        }
    }

    fn send_next(&mut self, ctx: &mut TaskContext<'_>, count: usize) {
        let mut sent = 0;
        while sent < count {
            let Some(peer) = self.pending.pop_front() else {
                break;
            };
            if self.arrived.contains(&peer.hash()) {
                continue;
            }
            let body = Body::BroadcastEventReq {
                event: self.event.name.clone(),
                params: self.event.params.clone(),
                origin: self.event.origin.clone(),
                event_id: self.event.event_id,
                arrived: self.disclose(peer.hash(), 0),
                hashbits: self.hashbits,
            };
            let id = ctx.request(&peer, body, self.base.id(), 0);
            trace!("broadcast {} sent to {}", self.event.name, peer.peerid());
            self.in_flight.push(InFlight {
                peer,
                id,
                since: ctx.now,
            });
            sent += 1;
        }
    }

    /// Gives up to `retry_batch` in-flight requests their next chance,
    /// continuing where the previous wake-up stopped.
    fn retry_some(&mut self, ctx: &mut TaskContext<'_>) {
        let grace = (ctx.config.send.resend_interval.as_millis() as u64)
            << ctx.config.send.resend_max_tries.min(16);
        let mut visited = 0;
        while visited < self.retry_batch && !self.in_flight.is_empty() {
            if self.retry_cursor >= self.in_flight.len() {
                self.retry_cursor = 0;
            }
            let flight = &self.in_flight[self.retry_cursor];
            let gone = match flight.id {
                Some(id) => ctx.sender.resend(id, ctx.now) == ResendState::Exhausted,
                None => ctx.now.saturating_sub(flight.since) > grace,
            };
            if gone {
                let flight = self.in_flight.remove(self.retry_cursor);
                if let Some(id) = flight.id {
                    ctx.sender.cancel(id);
                }
                trace!("broadcast {} gave up on {}", self.event.name, flight.peer.peerid());
            } else {
                self.retry_cursor += 1;
            }
            visited += 1;
        }
    }

    fn check_emitted(&mut self) {
        if self.tx.is_some() && self.arrived_count() >= self.min_arrivals.max(1) {
            if let Some(tx) = self.tx.take() {
                let _ = tx.send(BroadcastResult {
                    result: ResultCode::Success,
                    arrived: self.arrived_count(),
                });
            }
        }
    }
}

impl Task for BroadcastTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn start(&mut self, ctx: &mut TaskContext<'_>) {
        if !self.base.start(ctx.now) {
            return;
        }
        self.collect_pending(ctx);
        debug!(
            "broadcast {} from {} ({} peers queued)",
            self.event.name,
            self.event.origin,
            self.pending.len()
        );
        self.send_next(ctx, self.flood_limit);
    }

    fn process(&mut self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        if !self.base.is_running() {
            return;
        }
        match &pkg.body {
            Body::BroadcastEventReq { .. } => self.on_request(ctx, pkg, from),
            Body::BroadcastEventResp { arrived, .. } => {
                self.base.touch(ctx.now);
                let known = self.settle(ctx, from.peerid());
                self.mark_arrived(from.hash());
                for hash in arrived {
                    self.mark_arrived(*hash);
                }
                if known {
                    self.send_next(ctx, 2);
                }
                self.check_emitted();
            }
            _ => {}
        }
    }

    fn wake_up(&mut self, ctx: &mut TaskContext<'_>) {
        if !self.base.is_running() {
            return;
        }
        self.retry_some(ctx);
        if self.in_flight.is_empty() {
            self.collect_pending(ctx);
            self.send_next(ctx, self.flood_limit);
        }
        self.check_emitted();
    }

    fn complete(&mut self, ctx: &mut TaskContext<'_>, result: ResultCode) {
        if !self.base.finish(result) {
            return;
        }
        for flight in self.in_flight.drain(..) {
            if let Some(id) = flight.id {
                ctx.sender.cancel(id);
            }
        }
        debug!(
            "broadcast {} finished: {:?} ({} arrived)",
            self.event.name,
            result,
            self.arrived_count()
        );
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(BroadcastResult {
                result,
                arrived: self.arrived_count(),
            });
        }
    }
}
