use std::collections::HashSet;

use super::TaskContext;
use crate::peer::{distance, Peer, PeerHash, PeerInfo};
use crate::protocol::Body;
use crate::send::{ResendId, ResendState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Query {
    Pending,
    InFlight { id: Option<ResendId>, since: u64 },
    Responded,
    Failed,
}

#[derive(Debug)]
struct Candidate {
    peer: Peer,
    distance: u32,
    query: Query,
}

/// Frontier of an iterative lookup: candidates sorted by XOR distance to the
/// target, of which only the closest `k` that have not failed are queried,
/// at most `alpha` at a time.
#[derive(Debug)]
pub(crate) struct Lookup {
    target: PeerHash,
    k: usize,
    alpha: usize,
    candidates: Vec<Candidate>,
    seen: HashSet<String>,
    reached: Vec<String>,
}

impl Lookup {
    pub fn new(target: PeerHash, k: usize, alpha: usize, local_peerid: &str) -> Self {
        Self {
            target,
            k: k.max(1),
            alpha: alpha.max(1),
            candidates: Vec::new(),
            seen: HashSet::from([local_peerid.to_string()]),
            reached: Vec::new(),
        }
    }

    /// Seeds the frontier with the closest reachable peers of the routing table.
    pub fn seed(&mut self, ctx: &TaskContext<'_>) {
        let peers: Vec<Peer> = ctx
            .routing
            .find_closest_peers_filtered(self.target, self.k, None, |p| {
                p.is_reachable() && p.is_member_of(ctx.service)
            })
            .into_iter()
            .cloned()
            .collect();
        for peer in peers {
            self.add(peer);
        }
    }

    /// Never queries `peerid`.
    pub fn exclude(&mut self, peerid: &str) {
        self.seen.insert(peerid.to_string());
    }

    /// Adds a candidate unless it was seen before. Returns true if added.
    pub fn add(&mut self, peer: Peer) -> bool {
        if !peer.is_reachable() || !self.seen.insert(peer.peerid().to_string()) {
            return false;
        }
        let dist = distance(peer.hash(), self.target);
        let pos = self.candidates.partition_point(|c| c.distance <= dist);
        self.candidates.insert(
            pos,
            Candidate {
                peer,
                distance: dist,
                query: Query::Pending,
            },
        );
        true
    }

    /// Adds neighbor hints, preferring what the routing table knows about them.
    pub fn add_hints(&mut self, ctx: &TaskContext<'_>, hints: &[PeerInfo]) {
        for hint in hints {
            let peer = match ctx.routing.find_peer(&hint.peerid) {
                Some(known) => known.clone(),
                None => Peer::new(hint.clone()),
            };
            self.add(peer);
        }
    }

    /// Records an answer from `peerid`. Returns false for peers that were
    /// never queried or answered before.
    pub fn on_response(&mut self, ctx: &mut TaskContext<'_>, peerid: &str) -> bool {
        let Some(candidate) = self.candidates.iter_mut().find(|c| c.peer.peerid() == peerid) else {
            return false;
        };
        match candidate.query {
            Query::InFlight { id, .. } => {
                if let Some(id) = id {
                    ctx.sender.cancel(id);
                }
            }
            Query::Pending | Query::Failed => {}
            Query::Responded => return false,
        }
        candidate.query = Query::Responded;
        self.add_reached(peerid);
        true
    }

    pub fn add_reached(&mut self, peerid: &str) {
        if !self.reached.iter().any(|r| r == peerid) {
            self.reached.push(peerid.to_string());
        }
    }

    pub fn reached(&self) -> &[String] {
        &self.reached
    }

    /// Retries in-flight requests and fills free slots of the window with
    /// new requests built by `body`.
    pub fn pump(
        &mut self,
        ctx: &mut TaskContext<'_>,
        task_id: u32,
        ttl: u8,
        body: impl Fn(&Peer) -> Body,
    ) {
        let grace = (ctx.config.send.resend_interval.as_millis() as u64)
            << ctx.config.send.resend_max_tries.min(16);

        for candidate in &mut self.candidates {
            let Query::InFlight { id, since } = candidate.query else {
                continue;
            };
            let failed = match id {
                Some(id) => match ctx.sender.resend(id, ctx.now) {
                    ResendState::Exhausted => {
                        ctx.sender.cancel(id);
                        true
                    }
                    _ => false,
                },
                None => ctx.now.saturating_sub(since) > grace,
            };
            if failed {
                candidate.query = Query::Failed;
            }
        }

        let mut in_flight = self.window().filter(|c| matches!(c.query, Query::InFlight { .. })).count();
        let mut window = 0;
        for candidate in &mut self.candidates {
            if candidate.query == Query::Failed {
                continue;
            }
            window += 1;
            if window > self.k || in_flight >= self.alpha {
                break;
            }
            if candidate.query == Query::Pending {
                let id = ctx.request(&candidate.peer, body(&candidate.peer), task_id, ttl);
                candidate.query = Query::InFlight { id, since: ctx.now };
                in_flight += 1;
            }
        }
    }

    /// True once every candidate of the window answered or failed.
    pub fn is_converged(&self) -> bool {
        self.window()
            .all(|c| matches!(c.query, Query::Responded))
    }

    /// Closest candidates that answered, nearest first.
    pub fn closest_responded(&self, count: usize) -> Vec<Peer> {
        self.candidates
            .iter()
            .filter(|c| c.query == Query::Responded)
            .take(count)
            .map(|c| c.peer.clone())
            .collect()
    }

    /// Releases the resend controllers of unanswered requests.
    pub fn cancel(&mut self, ctx: &mut TaskContext<'_>) {
        for candidate in &mut self.candidates {
            if let Query::InFlight { id: Some(id), .. } = candidate.query {
                ctx.sender.cancel(id);
                candidate.query = Query::Failed;
            }
        }
    }

    fn window(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates
            .iter()
            .filter(|c| c.query != Query::Failed)
            .take(self.k)
    }
}
