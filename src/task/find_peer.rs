use tokio::sync::oneshot;
use tracing::debug;

use super::lookup::Lookup;
use super::{Completion, Task, TaskBase, TaskContext};
use crate::dht::ResultCode;
use crate::peer::{hash_peerid, Peer, PeerInfo};
use crate::protocol::{Body, Package};

/// Outcome of a peer lookup.
#[derive(Debug, Clone, Default)]
pub struct FindPeerResult {
    pub result: ResultCode,
    pub peer: Option<Peer>,
    /// Closest peers that answered, nearest first.
    pub near_nodes: Vec<Peer>,
    /// Peer ids the lookup reached, directly or through relays.
    pub reached: Vec<String>,
}

/// Requester of a forwarded lookup, answered on completion.
#[derive(Debug)]
struct Relay {
    requester: Peer,
    request: Package,
}

/// Iterative lookup of one peer id.
pub struct FindPeerTask {
    base: TaskBase,
    target: String,
    ttl: u8,
    lookup: Lookup,
    /// Looking up the local id only fills buckets, so it never stops early.
    self_lookup: bool,
    found: Option<Peer>,
    tx: Option<oneshot::Sender<FindPeerResult>>,
    relay: Option<Relay>,
}

impl FindPeerTask {
    pub fn new(
        ctx: &TaskContext<'_>,
        id: u32,
        target: &str,
    ) -> (Self, Completion<FindPeerResult>) {
        let (tx, rx) = oneshot::channel();
        let base = TaskBase::new(
            id,
            ctx.service.clone(),
            ctx.now,
            ctx.config.task.timeout,
            Some(ctx.config.task.max_idle),
        );
        let mut task = Self::with_base(ctx, base, target, ctx.config.protocol.find_peer_ttl);
        task.tx = Some(tx);
        (task, rx)
    }

    /// A lookup run on behalf of `requester`, who receives a
    /// `FIND_PEER_RESP` when it completes.
    pub fn relay(ctx: &TaskContext<'_>, id: u32, target: &str, requester: Peer, request: Package) -> Self {
        let base = TaskBase::new(
            id,
            ctx.service.clone(),
            ctx.now,
            ctx.config.task.relay_timeout,
            Some(ctx.config.task.max_idle),
        );
        let ttl = request.ttl.saturating_sub(1);
        let mut task = Self::with_base(ctx, base, target, ttl);
        task.lookup.add_reached(ctx.local.peerid());
        task.lookup.exclude(requester.peerid());
        task.relay = Some(Relay { requester, request });
        task
    }

    fn with_base(ctx: &TaskContext<'_>, base: TaskBase, target: &str, ttl: u8) -> Self {
        let lookup = Lookup::new(
            hash_peerid(target),
            ctx.config.task.k,
            ctx.config.task.alpha,
            ctx.local.peerid(),
        );
        Self {
            base,
            target: target.to_string(),
            ttl,
            lookup,
            self_lookup: target == ctx.local.peerid(),
            found: None,
            tx: None,
            relay: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The requester and correlation id of a forwarded lookup.
    pub fn relay_key(&self) -> Option<(String, u32)> {
        let relay = self.relay.as_ref()?;
        Some((relay.requester.peerid().to_string(), relay.request.task_id()?))
    }

    fn step(&mut self, ctx: &mut TaskContext<'_>) {
        let target = self.target.clone();
        let id = self.base.id();
        self.lookup
            .pump(ctx, id, self.ttl, |_| Body::FindPeerReq { target: target.clone() });
        if self.lookup.is_converged() {
            let result = if self.self_lookup && !self.lookup.closest_responded(1).is_empty() {
                ResultCode::Success
            } else {
                ResultCode::NotFound
            };
            self.complete(ctx, result);
        }
    }

    fn accept_hint(&self, ctx: &TaskContext<'_>, hint: &PeerInfo) -> Option<Peer> {
        if hint.peerid != self.target {
            return None;
        }
        Some(match ctx.routing.find_peer(&hint.peerid) {
            Some(known) => known.clone(),
            None => Peer::new(hint.clone()),
        })
    }
}

impl Task for FindPeerTask {
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
        if let Some(peer) = ctx.routing.find_peer(&self.target).filter(|_| !self.self_lookup) {
            self.found = Some(peer.clone());
            self.complete(ctx, ResultCode::Success);
            return;
        }
        self.lookup.seed(ctx);
        self.step(ctx);
    }

    fn process(&mut self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        if !self.base.is_running() {
            return;
        }
        let Body::FindPeerResp { reached, .. } = &pkg.body else {
            return;
        };
        if !self.lookup.on_response(ctx, from.peerid()) {
            return;
        }
        self.base.touch(ctx.now);
        for peerid in reached {
            self.lookup.add_reached(peerid);
        }

        if from.peerid() == self.target && !self.self_lookup {
            self.found = Some(from.clone());
        }
        let hints = pkg.common.as_ref().map(|c| c.nodes.as_slice()).unwrap_or_default();
        if self.found.is_none() && !self.self_lookup {
            self.found = hints.iter().find_map(|h| self.accept_hint(ctx, h));
        }
        if self.found.is_some() {
            self.complete(ctx, ResultCode::Success);
            return;
        }

        self.lookup.add_hints(ctx, hints);
        self.step(ctx);
    }

    fn wake_up(&mut self, ctx: &mut TaskContext<'_>) {
        if self.base.is_running() {
            self.step(ctx);
        }
    }

    fn complete(&mut self, ctx: &mut TaskContext<'_>, result: ResultCode) {
        if !self.base.finish(result) {
            return;
        }
        self.lookup.cancel(ctx);
        let near_nodes = self.lookup.closest_responded(ctx.config.task.k);
        debug!(
            "find peer {} finished: {:?} ({} reached)",
            self.target,
            result,
            self.lookup.reached().len()
        );

        if let Some(relay) = self.relay.take() {
            let mut nodes: Vec<PeerInfo> = self.found.iter().map(Peer::to_hint).collect();
            nodes.extend(
                near_nodes
                    .iter()
                    .filter(|p| p.peerid() != relay.requester.peerid())
                    .map(Peer::to_hint),
            );
            nodes.truncate(ctx.config.task.max_closer_hints);
            let body = Body::FindPeerResp {
                result,
                reached: self.lookup.reached().to_vec(),
            };
            ctx.sender
                .reply_with(ctx.now, &relay.requester, &relay.request, body, nodes);
        }

        if let Some(tx) = self.tx.take() {
            let _ = tx.send(FindPeerResult {
                result,
                peer: self.found.clone(),
                near_nodes,
                reached: self.lookup.reached().to_vec(),
            });
        }
    }
}
