//! Value lookups and writes.
//!
//! Both tasks walk toward the peers closest to the table hash. A get stops
//! at the first hit for a precise key and merges every answer for
//! [`TOTAL_KEY`]; a save writes to every peer of the converged window.
//! Either may run as a relay for a remote requester, who receives the answer
//! together with the set of peers the relay reached.

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use super::lookup::Lookup;
use super::{Completion, Task, TaskBase, TaskContext};
use crate::constants::TOTAL_KEY;
use crate::dht::ResultCode;
use crate::peer::{hash_peerid, Peer, PeerInfo};
use crate::protocol::{Body, Package};

#[derive(Debug, Clone, Default)]
pub struct GetValueResult {
    pub result: ResultCode,
    pub values: BTreeMap<String, Bytes>,
    pub reached: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SaveValueResult {
    pub result: ResultCode,
    pub reached: Vec<String>,
}

#[derive(Debug)]
struct Relay {
    requester: Peer,
    request: Package,
}

impl Relay {
    fn key(&self) -> Option<(String, u32)> {
        Some((self.requester.peerid().to_string(), self.request.task_id()?))
    }
}

fn lookup_for(ctx: &TaskContext<'_>, table: &str, k: usize) -> Lookup {
    Lookup::new(hash_peerid(table), k, ctx.config.task.alpha, ctx.local.peerid())
}

fn relay_hints(ctx: &TaskContext<'_>, lookup: &Lookup, relay: &Relay) -> Vec<PeerInfo> {
    lookup
        .closest_responded(ctx.config.task.max_closer_hints)
        .iter()
        .filter(|p| p.peerid() != relay.requester.peerid())
        .map(Peer::to_hint)
        .collect()
}

/// Reads one key, or a whole table, from the network.
pub struct GetValueTask {
    base: TaskBase,
    table: String,
    key: String,
    ttl: u8,
    lookup: Lookup,
    values: BTreeMap<String, Bytes>,
    tx: Option<oneshot::Sender<GetValueResult>>,
    relay: Option<Relay>,
}

impl GetValueTask {
    pub fn new(
        ctx: &TaskContext<'_>,
        id: u32,
        table: &str,
        key: &str,
    ) -> (Self, Completion<GetValueResult>) {
        let (tx, rx) = oneshot::channel();
        let base = TaskBase::new(
            id,
            ctx.service.clone(),
            ctx.now,
            ctx.config.task.timeout,
            Some(ctx.config.task.max_idle),
        );
        let mut task = Self::with_base(ctx, base, table, key, ctx.config.protocol.value_ttl);
        task.tx = Some(tx);
        (task, rx)
    }

    pub fn relay(
        ctx: &TaskContext<'_>,
        id: u32,
        table: &str,
        key: &str,
        requester: Peer,
        request: Package,
    ) -> Self {
        let base = TaskBase::new(
            id,
            ctx.service.clone(),
            ctx.now,
            ctx.config.task.relay_timeout,
            Some(ctx.config.task.max_idle),
        );
        let ttl = request.ttl.saturating_sub(1);
        let mut task = Self::with_base(ctx, base, table, key, ttl);
        task.lookup.add_reached(ctx.local.peerid());
        task.lookup.exclude(requester.peerid());
        task.relay = Some(Relay { requester, request });
        task
    }

    fn with_base(ctx: &TaskContext<'_>, base: TaskBase, table: &str, key: &str, ttl: u8) -> Self {
        Self {
            base,
            table: table.to_string(),
            key: key.to_string(),
            ttl,
            lookup: lookup_for(ctx, table, ctx.config.task.k),
            values: BTreeMap::new(),
            tx: None,
            relay: None,
        }
    }

    pub fn relay_key(&self) -> Option<(String, u32)> {
        self.relay.as_ref()?.key()
    }

    fn is_total(&self) -> bool {
        self.key == TOTAL_KEY
    }

    fn step(&mut self, ctx: &mut TaskContext<'_>) {
        let (table, key) = (self.table.clone(), self.key.clone());
        let id = self.base.id();
        self.lookup.pump(ctx, id, self.ttl, |_| Body::FindValueReq {
            table: table.clone(),
            key: key.clone(),
        });
        if self.lookup.is_converged() {
            let result = if self.values.is_empty() {
                ResultCode::NotFound
            } else {
                ResultCode::Success
            };
            self.complete(ctx, result);
        }
    }
}

impl Task for GetValueTask {
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
        if let Some(local) = ctx.values.find_value(&self.table, &self.key) {
            self.values.extend(local);
            if !self.is_total() {
                self.complete(ctx, ResultCode::Success);
                return;
            }
        }
        self.lookup.seed(ctx);
        self.step(ctx);
    }

    fn process(&mut self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        if !self.base.is_running() {
            return;
        }
        let Body::FindValueResp {
            result,
            values,
            reached,
        } = &pkg.body
        else {
            return;
        };
        if !self.lookup.on_response(ctx, from.peerid()) {
            return;
        }
        self.base.touch(ctx.now);
        for peerid in reached {
            self.lookup.add_reached(peerid);
        }

        if result.is_success() && !values.is_empty() {
            // Answers for a single key may carry unrelated keys from a relay.
            if self.is_total() {
                self.values
                    .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            } else if let Some(v) = values.get(&self.key) {
                self.values.insert(self.key.clone(), v.clone());
                self.complete(ctx, ResultCode::Success);
                return;
            }
        }

        if let Some(common) = &pkg.common {
            self.lookup.add_hints(ctx, &common.nodes);
        }
        self.step(ctx);
    }

    fn wake_up(&mut self, ctx: &mut TaskContext<'_>) {
        if self.base.is_running() {
            self.step(ctx);
        }
    }

    fn complete(&mut self, ctx: &mut TaskContext<'_>, mut result: ResultCode) {
        // A table read that timed out still returns what it collected.
        if result == ResultCode::Timeout && self.is_total() && !self.values.is_empty() {
            result = ResultCode::Success;
        }
        if !self.base.finish(result) {
            return;
        }
        self.lookup.cancel(ctx);
        debug!(
            "get value {}/{} finished: {:?} ({} values)",
            self.table,
            self.key,
            result,
            self.values.len()
        );

        if let Some(relay) = self.relay.take() {
            let nodes = relay_hints(ctx, &self.lookup, &relay);
            let body = Body::FindValueResp {
                result,
                values: self.values.clone(),
                reached: self.lookup.reached().to_vec(),
            };
            ctx.sender
                .reply_with(ctx.now, &relay.requester, &relay.request, body, nodes);
        }

        if let Some(tx) = self.tx.take() {
            let _ = tx.send(GetValueResult {
                result,
                values: std::mem::take(&mut self.values),
                reached: self.lookup.reached().to_vec(),
            });
        }
    }
}

/// Writes one key to the peers closest to its table.
pub struct SaveValueTask {
    base: TaskBase,
    table: String,
    key: String,
    value: Bytes,
    ttl: u8,
    lookup: Lookup,
    tx: Option<oneshot::Sender<SaveValueResult>>,
    relay: Option<Relay>,
}

impl SaveValueTask {
    pub fn new(
        ctx: &TaskContext<'_>,
        id: u32,
        table: &str,
        key: &str,
        value: Bytes,
    ) -> (Self, Completion<SaveValueResult>) {
        let (tx, rx) = oneshot::channel();
        let base = TaskBase::new(
            id,
            ctx.service.clone(),
            ctx.now,
            ctx.config.task.timeout,
            Some(ctx.config.task.max_idle),
        );
        let mut task = Self::with_base(ctx, base, table, key, value, ctx.config.protocol.value_ttl);
        task.tx = Some(tx);
        (task, rx)
    }

    pub fn relay(
        ctx: &TaskContext<'_>,
        id: u32,
        table: &str,
        key: &str,
        value: Bytes,
        requester: Peer,
        request: Package,
    ) -> Self {
        let base = TaskBase::new(
            id,
            ctx.service.clone(),
            ctx.now,
            ctx.config.task.relay_timeout,
            Some(ctx.config.task.max_idle),
        );
        let ttl = request.ttl.saturating_sub(1);
        let mut task = Self::with_base(ctx, base, table, key, value, ttl);
        task.lookup.add_reached(ctx.local.peerid());
        task.lookup.exclude(requester.peerid());
        task.relay = Some(Relay { requester, request });
        task
    }

    fn with_base(
        ctx: &TaskContext<'_>,
        base: TaskBase,
        table: &str,
        key: &str,
        value: Bytes,
        ttl: u8,
    ) -> Self {
        Self {
            base,
            table: table.to_string(),
            key: key.to_string(),
            value,
            ttl,
            lookup: lookup_for(ctx, table, ctx.config.value.replicas),
            tx: None,
            relay: None,
        }
    }

    pub fn relay_key(&self) -> Option<(String, u32)> {
        self.relay.as_ref()?.key()
    }

    fn step(&mut self, ctx: &mut TaskContext<'_>) {
        let id = self.base.id();
        let (table, key, value) = (&self.table, &self.key, &self.value);
        self.lookup.pump(ctx, id, self.ttl, |_| Body::UpdateValueReq {
            table: table.clone(),
            key: key.clone(),
            value: value.clone(),
        });
        if self.lookup.is_converged() {
            self.finish_by_reach(ctx);
        }
    }

    fn finish_by_reach(&mut self, ctx: &mut TaskContext<'_>) {
        let result = if self.lookup.reached().is_empty() {
            ResultCode::Failed
        } else {
            ResultCode::Success
        };
        self.complete(ctx, result);
    }
}

impl Task for SaveValueTask {
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
        self.lookup.seed(ctx);
        self.step(ctx);
    }

    fn process(&mut self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        if !self.base.is_running() {
            return;
        }
        let Body::UpdateValueResp { reached, .. } = &pkg.body else {
            return;
        };
        if !self.lookup.on_response(ctx, from.peerid()) {
            return;
        }
        self.base.touch(ctx.now);
        for peerid in reached {
            self.lookup.add_reached(peerid);
        }
        if let Some(common) = &pkg.common {
            self.lookup.add_hints(ctx, &common.nodes);
        }
        self.step(ctx);
    }

    fn wake_up(&mut self, ctx: &mut TaskContext<'_>) {
        if self.base.is_running() {
            self.step(ctx);
        }
    }

    fn complete(&mut self, ctx: &mut TaskContext<'_>, mut result: ResultCode) {
        // Reaching anyone before the deadline counts as a write.
        if result == ResultCode::Timeout && !self.lookup.reached().is_empty() {
            result = ResultCode::Success;
        }
        if !self.base.finish(result) {
            return;
        }
        self.lookup.cancel(ctx);
        debug!(
            "save value {}/{} finished: {:?} ({} reached)",
            self.table,
            self.key,
            result,
            self.lookup.reached().len()
        );

        if let Some(relay) = self.relay.take() {
            let nodes = relay_hints(ctx, &self.lookup, &relay);
            let body = Body::UpdateValueResp {
                result,
                reached: self.lookup.reached().to_vec(),
            };
            ctx.sender
                .reply_with(ctx.now, &relay.requester, &relay.request, body, nodes);
        }

        if let Some(tx) = self.tx.take() {
            let _ = tx.send(SaveValueResult {
                result,
                reached: self.lookup.reached().to_vec(),
            });
        }
    }
}
