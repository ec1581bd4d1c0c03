//! Inbound package handling.
//!
//! Every datagram is decoded, its sender merged into the routing tables and
//! its hints considered, then it is either routed to the task it answers or
//! served as a request. Requests the local peer cannot fully answer are
//! relayed through a task while hops remain, otherwise answered with the
//! closest peers known.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::registry::AnyTask;
use super::{Dht, ResultCode};
use crate::constants::{MAX_HAND_OFF_TABLES, TOTAL_KEY};
use crate::peer::{hash_peerid, Endpoint, Peer, PeerInfo, ServicePath};
use crate::protocol::{Body, Package, ProtocolError};
use crate::send::PackageOptions;
use crate::task::{
    BroadcastEvent, BroadcastTask, FindPeerTask, GetValueTask, HandshakeAgency, HandshakeTarget,
    SaveValueTask,
};
use crate::value_table::DistributedValueTable;

impl Dht {
    /// Handles one datagram received from `from`.
    pub fn process_packet(&mut self, data: &[u8], from: Endpoint) {
        if self.stopped {
            return;
        }
        self.process_datagram(data, from, true);
        self.flush_oversized();
    }

    fn process_datagram(&mut self, data: &[u8], from: Endpoint, outer: bool) {
        let pkg = match self.sender.codec().decode(data) {
            Ok(pkg) => pkg,
            Err(ProtocolError::HashMismatch(peerid)) => {
                warn!("dropping package from {} spoofing {}", from, peerid);
                return;
            }
            Err(e) => {
                debug!("dropping package from {}: {}", from, e);
                return;
            }
        };
        trace!("{:?} from {}", pkg.command(), from);

        if let Body::CombinePackage { packages } = &pkg.body {
            if !outer {
                debug!("nested combined package from {}", from);
                return;
            }
            for inner in packages {
                self.process_datagram(inner, from, false);
            }
            return;
        }
        if matches!(pkg.body, Body::PackagePieceReq { .. }) {
            self.on_piece(&pkg, from, data.len());
            return;
        }
        self.on_package(pkg, from, data.len());
    }

    /// Acknowledges a piece and processes the rebuilt package once complete.
    fn on_piece(&mut self, pkg: &Package, from: Endpoint, len: usize) {
        let Body::PackagePieceReq {
            task_id,
            peerid,
            max,
            no,
            payload,
        } = &pkg.body
        else {
            return;
        };
        if PeerInfo::validate_peerid(peerid).is_err() {
            return;
        }
        let now = self.now();
        self.sender.on_received(peerid, pkg.ack_seq, len, now);

        let sender = match self.routing().find_peer(peerid) {
            Some(known) => known.clone().with_address(Some(from)),
            None => Peer::new(PeerInfo::new(peerid.as_str())).with_address(Some(from)),
        };
        self.sender.reply(
            now,
            &sender,
            pkg,
            Body::PackagePieceResp {
                task_id: *task_id,
                no: *no,
            },
        );

        let rebuilt = self
            .pieces
            .add_piece(peerid, *task_id, *max, *no, payload.clone(), now);
        if let Some(whole) = rebuilt {
            trace!("rebuilt {} bytes from {}", whole.len(), peerid);
            self.process_datagram(&whole, from, false);
        }
    }

    fn on_package(&mut self, pkg: Package, from: Endpoint, len: usize) {
        let Some(common) = pkg.common.as_ref() else {
            return;
        };
        if !common.dest_peerid.is_empty() && common.dest_peerid != self.local.peerid() {
            debug!(
                "package for {} delivered to {}",
                common.dest_peerid,
                self.local.peerid()
            );
            return;
        }
        if pkg.dest_hash != 0 && pkg.dest_hash != self.local.hash() {
            debug!("package with foreign destination hash {:08x}", pkg.dest_hash);
            return;
        }
        if common.src.peerid == self.local.peerid() {
            return;
        }
        let now = self.now();
        let first_contact = self
            .routing()
            .find_peer(&common.src.peerid)
            .map_or(true, |p| p.last_recv_time() == 0);

        if let Some(ep) = common.dest_ep {
            self.observed_local_address(ep);
        }

        let mut peer = Peer::new(common.src.clone()).with_address(Some(from));
        peer.set_online_duration(pkg.src_online_duration);
        peer.set_nat_type(pkg.src_nat_type);
        if let Some(rtt) = self.sender.on_received(peer.peerid(), pkg.ack_seq, len, now) {
            peer.update_rtt(rtt);
        }
        let sender = self.activate(peer, false, true, false);

        self.learn_hints(&common.nodes);
        if first_contact {
            self.hand_off_values(&sender);
        }

        if pkg.is_resp() {
            self.on_response(pkg, sender);
        } else {
            self.on_request(pkg, sender);
        }
    }

    /// Pushes to a peer heard from for the first time the tables it is now
    /// among the closest known peers for.
    fn hand_off_values(&mut self, peer: &Peer) {
        let now = self.now();
        let replicas = self.config.value.replicas;
        let mut offers = Vec::new();
        for (path, table) in &self.services {
            if table.routing.find_peer(peer.peerid()).is_none() {
                continue;
            }
            for name in table
                .values
                .find_closest_values(peer.hash(), MAX_HAND_OFF_TABLES, None)
            {
                let closest = table.routing.find_closest_peers(hash_peerid(name), replicas);
                if !closest.iter().any(|p| p.peerid() == peer.peerid()) {
                    continue;
                }
                let Some(values) = table.values.find_value(name, TOTAL_KEY) else {
                    continue;
                };
                for (key, value) in values {
                    offers.push((path.clone(), name.to_string(), key, value));
                }
            }
        }

        if !offers.is_empty() {
            debug!("handing {} values to {}", offers.len(), peer.peerid());
        }
        for (service, table, key, value) in offers {
            let opts = PackageOptions {
                service,
                ..Default::default()
            };
            let body = Body::UpdateValueReq { table, key, value };
            self.sender.send(now, peer, body, &opts);
        }
    }

    /// Adds hinted peers the root table has room for, unverified.
    fn learn_hints(&mut self, hints: &[PeerInfo]) {
        let now = self.now();
        let local = self.local.peerid().to_string();
        let Some(root) = self.services.get_mut(&ServicePath::root()) else {
            return;
        };
        for hint in hints {
            if hint.peerid == local
                || hint.eplist.is_empty()
                || PeerInfo::validate_peerid(&hint.peerid).is_err()
                || root.routing.find_peer(&hint.peerid).is_some()
                || !root.routing.is_expandable(&hint.peerid)
            {
                continue;
            }
            trace!("learned {} from hints", hint.peerid);
            root.routing
                .active_peer(Peer::new(hint.clone()), now, false, false, false);
        }
    }

    fn on_response(&mut self, pkg: Package, from: Peer) {
        let task_id = match &pkg.body {
            Body::PingResp => return,
            Body::PackagePieceResp { task_id, .. } => Some(*task_id),
            _ => pkg.task_id(),
        };
        let Some(id) = task_id.filter(|id| self.tasks.contains(*id)) else {
            trace!("{:?} from {} matches no task", pkg.command(), from.peerid());
            return;
        };
        self.drive(id, |task, ctx| task.as_task_mut().process(ctx, &pkg, &from));
    }

    fn on_request(&mut self, pkg: Package, from: Peer) {
        let now = self.now();
        match &pkg.body {
            Body::PingReq => self.sender.reply(now, &from, &pkg, Body::PingResp),
            Body::HandshakeReq => {
                self.sender.reply(now, &from, &pkg, Body::HandshakeResp);
                let ids = [self.tasks.source(from.peerid()), self.tasks.target(from.peerid())];
                for id in ids.into_iter().flatten() {
                    self.drive(id, |task, ctx| task.as_task_mut().process(ctx, &pkg, &from));
                }
            }
            Body::FindPeerReq { target } => self.on_find_peer(&pkg, &from, target),
            Body::FindValueReq { table, key } => self.on_find_value(&pkg, &from, table, key),
            Body::UpdateValueReq { table, key, value } => {
                self.on_update_value(&pkg, &from, table, key, value)
            }
            Body::HoleCallReq { target, target_eps } => {
                self.on_hole_call(&pkg, &from, target, target_eps)
            }
            Body::HoleCalledReq { source } => self.on_hole_called(&pkg, &from, source),
            Body::BroadcastEventReq { .. } => self.on_broadcast(&pkg, &from),
            other => trace!("unexpected request {:?}", other.command()),
        }
    }

    /// True if this request is already being relayed for `from`.
    fn is_relayed(&self, pkg: &Package, from: &Peer) -> bool {
        pkg.task_id()
            .and_then(|tid| self.tasks.relay(from.peerid(), tid))
            .is_some()
    }

    fn can_relay(&self, pkg: &Package) -> bool {
        pkg.ttl > 0 && pkg.task_id().is_some()
    }

    fn service_of(pkg: &Package) -> ServicePath {
        pkg.common
            .as_ref()
            .map(|c| c.service.clone())
            .unwrap_or_default()
    }

    fn on_find_peer(&mut self, pkg: &Package, from: &Peer, target: &str) {
        let now = self.now();
        let service = Self::service_of(pkg);
        let local = self.local.peerid().to_string();
        let reached = vec![local.clone()];

        let Some(table) = self.services.get(&service) else {
            let body = Body::FindPeerResp {
                result: ResultCode::NotFound,
                reached,
            };
            self.sender.reply(now, from, pkg, body);
            return;
        };

        let found = if target == local {
            Some(self.local.to_hint())
        } else {
            table.routing.find_peer(target).map(Peer::to_hint)
        };

        if let Some(hint) = found {
            let mut nodes = vec![hint];
            nodes.extend(
                self.closer_hints(&service, target, from.peerid())
                    .into_iter()
                    .filter(|h| h.peerid != target),
            );
            nodes.truncate(self.config.task.max_closer_hints);
            let body = Body::FindPeerResp {
                result: ResultCode::Success,
                reached,
            };
            self.sender.reply_with(now, from, pkg, body, nodes);
            return;
        }

        if self.can_relay(pkg) {
            if self.is_relayed(pkg, from) {
                return;
            }
            let (requester, request) = (from.clone(), pkg.clone());
            let _ = self.spawn(&service, |ctx, id| {
                let task = FindPeerTask::relay(ctx, id, target, requester, request);
                (AnyTask::FindPeer(task), ())
            });
            return;
        }

        let nodes = self.closer_hints(&service, target, from.peerid());
        let body = Body::FindPeerResp {
            result: ResultCode::NotFound,
            reached,
        };
        self.sender.reply_with(now, from, pkg, body, nodes);
    }

    fn on_find_value(&mut self, pkg: &Package, from: &Peer, table: &str, key: &str) {
        let now = self.now();
        let service = Self::service_of(pkg);
        let reached = vec![self.local.peerid().to_string()];
        let reply = |result, values| Body::FindValueResp {
            result,
            values,
            reached: reached.clone(),
        };

        if DistributedValueTable::validate(table, key, true).is_err() {
            let body = reply(ResultCode::InvalidArgs, Default::default());
            self.sender.reply(now, from, pkg, body);
            return;
        }
        let Some(service_table) = self.services.get(&service) else {
            let body = reply(ResultCode::NotFound, Default::default());
            self.sender.reply(now, from, pkg, body);
            return;
        };

        let local_values = service_table.values.find_value(table, key);
        if let Some(values) = &local_values {
            if key != TOTAL_KEY {
                let body = reply(ResultCode::Success, values.clone());
                self.sender.reply(now, from, pkg, body);
                return;
            }
        }

        if self.can_relay(pkg) {
            if self.is_relayed(pkg, from) {
                return;
            }
            let (requester, request) = (from.clone(), pkg.clone());
            let _ = self.spawn(&service, |ctx, id| {
                let task = GetValueTask::relay(ctx, id, table, key, requester, request);
                (AnyTask::GetValue(task), ())
            });
            return;
        }

        let (result, values) = match local_values {
            Some(values) if !values.is_empty() => (ResultCode::Success, values),
            _ => (ResultCode::NotFound, Default::default()),
        };
        let nodes = self.closer_hints(&service, table, from.peerid());
        self.sender
            .reply_with(now, from, pkg, reply(result, values), nodes);
    }

    fn on_update_value(&mut self, pkg: &Package, from: &Peer, table: &str, key: &str, value: &Bytes) {
        let now = self.now();
        let service = Self::service_of(pkg);
        let reached = vec![self.local.peerid().to_string()];

        if DistributedValueTable::validate(table, key, false).is_err() {
            let body = Body::UpdateValueResp {
                result: ResultCode::InvalidArgs,
                reached: Vec::new(),
            };
            self.sender.reply(now, from, pkg, body);
            return;
        }
        let Some(service_table) = self.services.get_mut(&service) else {
            let body = Body::UpdateValueResp {
                result: ResultCode::NotFound,
                reached: Vec::new(),
            };
            self.sender.reply(now, from, pkg, body);
            return;
        };
        if let Err(e) = service_table
            .values
            .update_value(table, key, value.clone(), now)
        {
            debug!("rejected value {}/{} from {}: {}", table, key, from.peerid(), e);
            let body = Body::UpdateValueResp {
                result: ResultCode::from(&e),
                reached: Vec::new(),
            };
            self.sender.reply(now, from, pkg, body);
            return;
        }

        // A value we could not carry onward in our own envelope stays here.
        let forwardable = self.check_value_len(&service, table, key, value).is_ok();
        if forwardable && self.can_relay(pkg) {
            if self.is_relayed(pkg, from) {
                return;
            }
            let (requester, request) = (from.clone(), pkg.clone());
            let value = value.clone();
            let _ = self.spawn(&service, |ctx, id| {
                let task = SaveValueTask::relay(ctx, id, table, key, value, requester, request);
                (AnyTask::SaveValue(task), ())
            });
            return;
        }

        let nodes = self.closer_hints(&service, table, from.peerid());
        let body = Body::UpdateValueResp {
            result: ResultCode::Success,
            reached,
        };
        self.sender.reply_with(now, from, pkg, body, nodes);
    }

    /// A source asks us to introduce it to `target`.
    fn on_hole_call(&mut self, pkg: &Package, from: &Peer, target: &str, target_eps: &[Endpoint]) {
        if let Some(id) = self.tasks.agency(from.peerid(), target) {
            self.drive(id, |task, ctx| {
                if let AnyTask::Agency(agency) = task {
                    agency.on_duplicate(ctx, pkg, from);
                }
            });
            return;
        }

        let now = self.now();
        let known = self.routing().find_peer(target).cloned();
        let target = match known {
            Some(peer) => peer,
            None if !target_eps.is_empty() && PeerInfo::validate_peerid(target).is_ok() => {
                let mut info = PeerInfo::new(target);
                info.eplist = target_eps.to_vec();
                Peer::new(info)
            }
            None => {
                let body = Body::HoleCallResp {
                    result: ResultCode::NotFound,
                    target: None,
                };
                self.sender.reply(now, from, pkg, body);
                return;
            }
        };

        debug!("introducing {} to {}", from.peerid(), target.peerid());
        let (source, request) = (from.clone(), pkg.clone());
        let _ = self.spawn(&ServicePath::root(), |ctx, id| {
            let task = HandshakeAgency::new(ctx, id, source, target, request);
            (AnyTask::Agency(task), ())
        });
    }

    /// An agency tells us `source` wants to reach us.
    fn on_hole_called(&mut self, pkg: &Package, from: &Peer, source: &PeerInfo) {
        if let Some(id) = self.tasks.target(&source.peerid) {
            self.drive(id, |task, ctx| {
                if let AnyTask::Target(target) = task {
                    target.on_duplicate(ctx, pkg, from);
                }
            });
            return;
        }

        let now = self.now();
        let body = Body::HoleCalledResp {
            result: ResultCode::Success,
        };
        self.sender.reply(now, from, pkg, body);

        if source.peerid == self.local.peerid() || PeerInfo::validate_peerid(&source.peerid).is_err() {
            return;
        }
        let source = Peer::new(source.clone());
        let _ = self.spawn(&ServicePath::root(), |ctx, id| {
            let task = HandshakeTarget::new(ctx, id, source);
            (AnyTask::Target(task), ())
        });
    }

    /// Delivers a broadcast event once and keeps it spreading.
    fn on_broadcast(&mut self, pkg: &Package, from: &Peer) {
        let Body::BroadcastEventReq {
            event,
            params,
            origin,
            event_id,
            ..
        } = &pkg.body
        else {
            return;
        };

        if let Some(id) = self.tasks.broadcast(origin, *event_id) {
            self.drive(id, |task, ctx| {
                if let AnyTask::Broadcast(broadcast) = task {
                    broadcast.on_request(ctx, pkg, from);
                }
            });
            return;
        }

        let now = self.now();
        let service = Self::service_of(pkg);
        let seen = self
            .seen_broadcasts
            .contains_key(&(origin.clone(), *event_id));
        if seen || !self.services.contains_key(&service) || event.is_empty() {
            let body = Body::BroadcastEventResp {
                result: ResultCode::Success,
                arrived: Vec::new(),
            };
            self.sender.reply(now, from, pkg, body);
            return;
        }

        self.mark_seen(origin, *event_id);
        let event = BroadcastEvent {
            name: event.clone(),
            params: params.clone(),
            origin: origin.clone(),
            event_id: *event_id,
            service: service.clone(),
        };
        debug!(
            "broadcast {} #{} from {} via {}",
            event.name,
            event.event_id,
            event.origin,
            from.peerid()
        );
        self.deliver_event(&event);

        let _ = self.spawn(&service, |ctx, id| {
            let mut task = BroadcastTask::relay(ctx, id, event);
            task.on_request(ctx, pkg, from);
            (AnyTask::Broadcast(task), ())
        });
    }
}

