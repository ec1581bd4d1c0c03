//! Long-lived request state machines.
//!
//! A task is created by the DHT, started once, then driven by two kinds of
//! events: packages routed to it (by correlation id or by an index the DHT
//! keeps) and the periodic wake-up tick. It completes exactly once, either by
//! itself or because its deadline passed or it went idle for too long.
//!
//! ```text
//!   created ──start()──► running ──complete(r)──► completed
//!                           │
//!                           └──abort()──────────► aborted
//! ```
//!
//! Tasks never touch the DHT directly. Everything they may use is lent to
//! them through a [`TaskContext`] for the duration of one call.

mod broadcast;
mod find_peer;
mod handshake;
mod lookup;
mod split;
mod value;

use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::DhtConfig;
use crate::dht::ResultCode;
use crate::peer::{Peer, PeerHash, PeerInfo, ServicePath};
use crate::protocol::{Body, Package};
use crate::routing::RoutingTable;
use crate::send::{PackageOptions, PackageSender, ResendId};
use crate::value_table::DistributedValueTable;

pub use broadcast::{BroadcastEvent, BroadcastResult, BroadcastTask};
pub use find_peer::{FindPeerResult, FindPeerTask};
pub use handshake::{HandshakeAgency, HandshakeResult, HandshakeSource, HandshakeTarget};
pub use split::SplitPackageTask;
pub use value::{GetValueResult, GetValueTask, SaveValueResult, SaveValueTask};

/// Receiving side of a task's result.
pub type Completion<T> = oneshot::Receiver<T>;

/// Everything a task may use during one call.
pub struct TaskContext<'a> {
    pub now: u64,
    pub config: &'a DhtConfig,
    pub local: &'a Peer,
    pub service: &'a ServicePath,
    pub routing: &'a mut RoutingTable,
    pub values: &'a mut DistributedValueTable,
    pub sender: &'a mut PackageSender,
}

impl TaskContext<'_> {
    /// Sends a reliable request on behalf of task `task_id`, piggybacking a
    /// few random neighbors.
    pub fn request(&mut self, dest: &Peer, body: Body, task_id: u32, ttl: u8) -> Option<ResendId> {
        let nodes = self.recommend(dest.peerid());
        let opts = PackageOptions {
            task_id: Some(task_id),
            service: self.service.clone(),
            ttl,
            nodes,
            reliable: true,
            ..Default::default()
        };
        let id = self.sender.send(self.now, dest, body, &opts);
        self.routing.touch_sent(dest.peerid(), self.now);
        id
    }

    pub fn reply(&mut self, to: &Peer, req: &Package, body: Body) {
        self.sender.reply(self.now, to, req, body);
    }

    /// Random reachable peers to advertise to `dest`.
    pub fn recommend(&self, dest: &str) -> Vec<PeerInfo> {
        self.routing
            .get_random_peers(self.config.task.recommend_neighbors, |p| {
                p.peerid() != dest && p.is_reachable()
            })
            .into_iter()
            .map(Peer::to_hint)
            .collect()
    }

    /// Known peers closest to `target`, as hints, leaving out `exclude`.
    pub fn closer_hints(&self, target: PeerHash, exclude: &str) -> Vec<PeerInfo> {
        self.routing
            .find_closest_peers_filtered(target, self.config.task.max_closer_hints, None, |p| {
                p.peerid() != exclude && p.is_reachable()
            })
            .into_iter()
            .map(Peer::to_hint)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Aborted,
}

/// Bookkeeping shared by every task: identity, state and deadlines.
#[derive(Debug)]
pub struct TaskBase {
    id: u32,
    service: ServicePath,
    state: TaskState,
    deadline: u64,
    max_idle: Option<u64>,
    last_active: u64,
}

impl TaskBase {
    pub fn new(
        id: u32,
        service: ServicePath,
        now: u64,
        timeout: Duration,
        max_idle: Option<Duration>,
    ) -> Self {
        Self {
            id,
            service,
            state: TaskState::Created,
            deadline: now + timeout.as_millis() as u64,
            max_idle: max_idle.map(|d| d.as_millis() as u64),
            last_active: now,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn service(&self) -> &ServicePath {
        &self.service
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TaskState::Completed | TaskState::Aborted)
    }

    pub fn touch(&mut self, now: u64) {
        self.last_active = self.last_active.max(now);
    }

    /// Past the absolute deadline, or idle for longer than allowed.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.deadline
            || self
                .max_idle
                .is_some_and(|idle| now.saturating_sub(self.last_active) > idle)
    }

    /// Moves to running; false if the task was started before.
    pub fn start(&mut self, now: u64) -> bool {
        if self.state != TaskState::Created {
            return false;
        }
        self.state = TaskState::Running;
        self.last_active = now;
        true
    }

    /// Moves to a final state; false if the task already finished.
    pub fn finish(&mut self, result: ResultCode) -> bool {
        if self.is_finished() {
            return false;
        }
        self.state = match result {
            ResultCode::Abort | ResultCode::Stopped => TaskState::Aborted,
            _ => TaskState::Completed,
        };
        true
    }
}

/// A pollable state machine owned by the DHT.
pub trait Task: Send {
    fn base(&self) -> &TaskBase;

    fn base_mut(&mut self) -> &mut TaskBase;

    /// Sends the first requests. Calling it twice has no effect.
    fn start(&mut self, ctx: &mut TaskContext<'_>);

    /// Handles a package routed to this task. `from` is the sender as it is
    /// now known to the routing table.
    fn process(&mut self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer);

    /// Periodic retry and progress step.
    fn wake_up(&mut self, ctx: &mut TaskContext<'_>);

    /// Finishes with `result`: releases resend controllers and delivers the
    /// result. Only the first call has an effect.
    fn complete(&mut self, ctx: &mut TaskContext<'_>, result: ResultCode);

    fn id(&self) -> u32 {
        self.base().id()
    }

    fn is_finished(&self) -> bool {
        self.base().is_finished()
    }

    /// Forced termination, e.g. on shutdown.
    fn abort(&mut self, ctx: &mut TaskContext<'_>, result: ResultCode) {
        self.complete(ctx, result);
    }

    /// One wake tick: expire or make progress.
    fn tick(&mut self, ctx: &mut TaskContext<'_>) {
        if self.is_finished() {
            return;
        }
        if self.base().is_expired(ctx.now) {
            self.complete(ctx, ResultCode::Timeout);
        } else {
            self.wake_up(ctx);
        }
    }
}

#[cfg(test)]
mod tests;
