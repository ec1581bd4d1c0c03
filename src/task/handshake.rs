//! Hole punching between two peers, with a third one as go-between.
//!
//! ```text
//!  source                    agency                    target
//!    │── HANDSHAKE_REQ ────────────────────────────────────►│  (may be dropped by NAT)
//!    │── HOLE_CALL_REQ ──────►│                             │
//!    │                        │── HOLE_CALLED_REQ ─────────►│
//!    │                        │◄─ HOLE_CALLED_RESP ─────────│
//!    │◄─ HOLE_CALL_RESP ──────│                             │
//!    │◄──────────────────────────────────── HANDSHAKE_REQ ──│
//!    │── HANDSHAKE_RESP ───────────────────────────────────►│
//! ```
//!
//! Each side sends toward the other's observed address, so both NATs see
//! outbound traffic before the inbound packets arrive.

use tokio::sync::oneshot;
use tracing::debug;

use super::{Completion, Task, TaskBase, TaskContext};
use crate::dht::ResultCode;
use crate::peer::{Peer, PeerInfo};
use crate::protocol::{Body, Package};
use crate::send::{ResendId, ResendState};

#[derive(Debug, Clone, Default)]
pub struct HandshakeResult {
    pub result: ResultCode,
    /// The target as seen after the handshake, with its live address.
    pub peer: Option<Peer>,
}

/// A peer's info with its observed address in front of the advertised ones.
fn observed_info(peer: &Peer) -> PeerInfo {
    let mut info = peer.info().clone();
    info.eplist = peer.destinations();
    info
}

fn resend_exhausted(ctx: &mut TaskContext<'_>, id: &mut Option<ResendId>) -> bool {
    let Some(current) = *id else {
        return false;
    };
    match ctx.sender.resend(current, ctx.now) {
        ResendState::Exhausted => {
            ctx.sender.cancel(current);
            *id = None;
            true
        }
        _ => false,
    }
}

fn release(ctx: &mut TaskContext<'_>, id: &mut Option<ResendId>) {
    if let Some(id) = id.take() {
        ctx.sender.cancel(id);
    }
}

/// The side that wants to reach the target.
pub struct HandshakeSource {
    base: TaskBase,
    target: Peer,
    agency: Option<Peer>,
    hole_call_at: u64,
    hole_call_sent: bool,
    hole_call_failed: bool,
    handshake: Option<ResendId>,
    hole_call: Option<ResendId>,
    tx: Option<oneshot::Sender<HandshakeResult>>,
}

impl HandshakeSource {
    pub fn new(
        ctx: &TaskContext<'_>,
        id: u32,
        target: Peer,
        agency: Option<Peer>,
    ) -> (Self, Completion<HandshakeResult>) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            base: TaskBase::new(
                id,
                ctx.service.clone(),
                ctx.now,
                ctx.config.task.handshake_timeout,
                None,
            ),
            target,
            agency,
            hole_call_at: ctx.now + ctx.config.task.hole_call_delay.as_millis() as u64,
            hole_call_sent: false,
            hole_call_failed: false,
            handshake: None,
            hole_call: None,
            tx: Some(tx),
        };
        (task, rx)
    }

    pub fn target(&self) -> &str {
        self.target.peerid()
    }

    fn send_handshake(&mut self, ctx: &mut TaskContext<'_>) {
        release(ctx, &mut self.handshake);
        self.handshake = ctx.request(&self.target, Body::HandshakeReq, self.base.id(), 0);
    }

    fn send_hole_call(&mut self, ctx: &mut TaskContext<'_>) {
        let Some(agency) = &self.agency else {
            return;
        };
        self.hole_call_sent = true;
        let body = Body::HoleCallReq {
            target: self.target.peerid().to_string(),
            target_eps: self.target.destinations(),
        };
        self.hole_call = ctx.request(agency, body, self.base.id(), 0);
    }
}

impl Task for HandshakeSource {
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
        self.send_handshake(ctx);
        if ctx.now >= self.hole_call_at {
            self.send_hole_call(ctx);
        }
    }

    fn process(&mut self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        if !self.base.is_running() {
            return;
        }
        self.base.touch(ctx.now);
        match &pkg.body {
            Body::HandshakeResp | Body::HandshakeReq if from.peerid() == self.target.peerid() => {
                self.target = from.clone();
                self.complete(ctx, ResultCode::Success);
            }
            Body::HoleCallResp { result, target } => {
                release(ctx, &mut self.hole_call);
                match target {
                    Some(info) if result.is_success() && info.peerid == self.target.peerid() => {
                        let seen = Peer::new(info.clone());
                        self.target.update(&seen, false, false);
                        self.send_handshake(ctx);
                    }
                    _ => {
                        debug!("agency could not reach {}: {:?}", self.target.peerid(), result);
                        self.hole_call_failed = true;
                        if self.handshake.is_none() {
                            self.complete(ctx, ResultCode::Failed);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn wake_up(&mut self, ctx: &mut TaskContext<'_>) {
        if !self.base.is_running() {
            return;
        }
        if !self.hole_call_sent && ctx.now >= self.hole_call_at {
            self.send_hole_call(ctx);
        }
        if resend_exhausted(ctx, &mut self.hole_call) {
            self.hole_call_failed = true;
        }
        if resend_exhausted(ctx, &mut self.handshake)
            && (self.agency.is_none() || self.hole_call_failed)
        {
            self.complete(ctx, ResultCode::Timeout);
        }
    }

    fn complete(&mut self, ctx: &mut TaskContext<'_>, result: ResultCode) {
        if !self.base.finish(result) {
            return;
        }
        release(ctx, &mut self.handshake);
        release(ctx, &mut self.hole_call);
        debug!("handshake with {} finished: {:?}", self.target.peerid(), result);
        if let Some(tx) = self.tx.take() {
            let peer = result.is_success().then(|| self.target.clone());
            let _ = tx.send(HandshakeResult { result, peer });
        }
    }
}

/// The go-between: relays a hole call to the target once and answers the
/// source; later duplicates get the cached answer.
pub struct HandshakeAgency {
    base: TaskBase,
    source: Peer,
    target: Peer,
    request: Package,
    called: Option<ResendId>,
    answer: Option<Body>,
}

impl HandshakeAgency {
    pub fn new(ctx: &TaskContext<'_>, id: u32, source: Peer, target: Peer, request: Package) -> Self {
        Self {
            base: TaskBase::new(
                id,
                ctx.service.clone(),
                ctx.now,
                ctx.config.task.handshake_timeout,
                None,
            ),
            source,
            target,
            request,
            called: None,
            answer: None,
        }
    }

    /// `(source, target)`, the identity of the hole call.
    pub fn key(&self) -> (String, String) {
        (self.source.peerid().to_string(), self.target.peerid().to_string())
    }

    /// Handles a repeated `HOLE_CALL_REQ` from the source.
    pub fn on_duplicate(&self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        if let Some(answer) = &self.answer {
            ctx.reply(from, pkg, answer.clone());
        }
    }

    fn answer(&mut self, ctx: &mut TaskContext<'_>, body: Body) {
        release(ctx, &mut self.called);
        ctx.reply(&self.source, &self.request, body.clone());
        self.answer = Some(body);
    }
}

impl Task for HandshakeAgency {
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
        let body = Body::HoleCalledReq {
            source: observed_info(&self.source),
        };
        self.called = ctx.request(&self.target, body, self.base.id(), 0);
        if self.called.is_none() {
            self.answer(
                ctx,
                Body::HoleCallResp {
                    result: ResultCode::Failed,
                    target: None,
                },
            );
        }
    }

    fn process(&mut self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        if !self.base.is_running() || self.answer.is_some() {
            return;
        }
        if !matches!(pkg.body, Body::HoleCalledResp { .. }) || from.peerid() != self.target.peerid() {
            return;
        }
        self.target = from.clone();
        let body = Body::HoleCallResp {
            result: ResultCode::Success,
            target: Some(observed_info(&self.target)),
        };
        debug!(
            "hole call {} -> {} acknowledged",
            self.source.peerid(),
            self.target.peerid()
        );
        self.answer(ctx, body);
    }

    fn wake_up(&mut self, ctx: &mut TaskContext<'_>) {
        if !self.base.is_running() || self.answer.is_some() {
            return;
        }
        if resend_exhausted(ctx, &mut self.called) {
            self.answer(
                ctx,
                Body::HoleCallResp {
                    result: ResultCode::Failed,
                    target: None,
                },
            );
        }
    }

    fn complete(&mut self, ctx: &mut TaskContext<'_>, result: ResultCode) {
        if self.base.finish(result) {
            release(ctx, &mut self.called);
        }
    }
}

/// The side being called: handshakes the source once, then lingers so that
/// repeated notices are only acknowledged.
pub struct HandshakeTarget {
    base: TaskBase,
    source: Peer,
    handshake: Option<ResendId>,
    done: bool,
}

impl HandshakeTarget {
    pub fn new(ctx: &TaskContext<'_>, id: u32, source: Peer) -> Self {
        Self {
            base: TaskBase::new(
                id,
                ctx.service.clone(),
                ctx.now,
                ctx.config.task.handshake_timeout,
                None,
            ),
            source,
            handshake: None,
            done: false,
        }
    }

    pub fn source(&self) -> &str {
        self.source.peerid()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Handles a repeated `HOLE_CALLED_REQ`.
    pub fn on_duplicate(&self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        ctx.reply(
            from,
            pkg,
            Body::HoleCalledResp {
                result: ResultCode::Success,
            },
        );
    }
}

impl Task for HandshakeTarget {
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
        self.handshake = ctx.request(&self.source, Body::HandshakeReq, self.base.id(), 0);
    }

    fn process(&mut self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        if self.done || from.peerid() != self.source.peerid() {
            return;
        }
        if matches!(pkg.body, Body::HandshakeReq | Body::HandshakeResp) {
            self.done = true;
            release(ctx, &mut self.handshake);
            debug!("hole punched toward {}", self.source.peerid());
        }
    }

    fn wake_up(&mut self, ctx: &mut TaskContext<'_>) {
        if self.base.is_running() && !self.done {
            resend_exhausted(ctx, &mut self.handshake);
        }
    }

    fn complete(&mut self, ctx: &mut TaskContext<'_>, result: ResultCode) {
        if self.base.finish(result) {
            release(ctx, &mut self.handshake);
        }
    }
}
