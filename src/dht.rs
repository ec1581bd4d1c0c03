//! The DHT orchestrator.
//!
//! [`Dht`] owns everything one overlay instance needs: the local peer, the
//! package sender, one [`ServiceTable`] per joined service path (the root
//! included), the live tasks and the piece rebuilder. It is a synchronous
//! state machine: inbound datagrams go through
//! [`process_packet`](Dht::process_packet), time advances through
//! [`poll`](Dht::poll), and every operation returns a completion handle that
//! fires when its task finishes. [`DhtServer`] puts it on a tokio UDP socket.
//!
//! # Examples
//!
//! ```no_run
//! use natdht::dht::{DhtServer, ServicePath};
//! use natdht::{DhtConfig, PeerInfo};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = DhtServer::bind(DhtConfig::default(), PeerInfo::new("alice"), "0.0.0.0:7000").await?;
//! let handle = server.handle();
//! tokio::spawn(server.run());
//!
//! let service = ServicePath::parse("chat/lobby")?;
//! handle.signin_server(service, Default::default()).await?;
//! let found = handle.find_peer("bob").await?;
//! println!("bob: {:?}", found.peer);
//! # Ok(())
//! # }
//! ```

mod error;
mod processor;
mod registry;
mod server;
mod service;

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

pub use error::{DhtError, ResultCode};
pub use server::{DhtHandle, DhtServer, DhtSnapshot, UdpTransport};
pub use service::{ServiceDht, ServiceRole, ServiceTable};

pub use crate::peer::ServicePath;

use crate::bencode::encoded_len;
use crate::clock::{Clock, Ticker};
use crate::config::DhtConfig;
use crate::constants::{HEADER_LENGTH, MAX_PEERID_LENGTH, MAX_PIECE_COUNT, SERVICE_FLAG_SERVER};
use crate::peer::{hash_peerid, Endpoint, Peer, PeerInfo, ServiceDescriptor};
use crate::piece::PieceRebuilder;
use crate::protocol::{Body, CommonSection};
use crate::routing::RoutingTable;
use crate::send::{PackageOptions, PackageSender, SendStats, Transport};
use crate::task::{
    BroadcastEvent, BroadcastResult, BroadcastTask, Completion, FindPeerResult, FindPeerTask,
    GetValueResult, GetValueTask, HandshakeResult, HandshakeSource, SaveValueResult,
    SaveValueTask, SplitPackageTask, TaskContext,
};
use crate::value_table::DistributedValueTable;
use registry::{AnyTask, TaskRegistry};

/// Identifies one attached broadcast listener.
pub type ListenerId = u64;

type ListenerKey = (ServicePath, String);

/// One DHT instance.
pub struct Dht {
    config: DhtConfig,
    clock: Arc<dyn Clock>,
    local: Peer,
    sender: PackageSender,
    services: BTreeMap<ServicePath, ServiceTable>,
    tasks: TaskRegistry,
    pieces: PieceRebuilder,
    listeners: HashMap<ListenerKey, Vec<(ListenerId, mpsc::UnboundedSender<BroadcastEvent>)>>,
    next_listener: ListenerId,
    /// `(origin, event id)` of broadcasts already delivered, with expiry.
    seen_broadcasts: HashMap<(String, u32), u64>,
    next_event_id: u32,
    start_time: u64,
    refresh: Ticker,
    wake: Ticker,
    republish: Ticker,
    find_self: Ticker,
    stopped: bool,
}

impl Dht {
    pub fn new(
        config: DhtConfig,
        local: PeerInfo,
        transport: Box<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DhtError> {
        config.validate().map_err(DhtError::InvalidArgs)?;
        PeerInfo::validate_peerid(&local.peerid)?;

        let now = clock.now_ms();
        let mut local = Peer::new(local);
        local.create_time = now;

        let sender = PackageSender::new(&config, transport, local.clone());
        let root = ServiceTable::new(ServicePath::root(), ServiceRole::Root, local.peerid(), &config);
        let mut services = BTreeMap::new();
        services.insert(ServicePath::root(), root);

        info!("dht {} started", local.peerid());

        Ok(Self {
            refresh: Ticker::new(config.refresh_tick, now),
            wake: Ticker::new(config.wake_tick, now),
            republish: Ticker::new(config.value.republish_interval, now),
            find_self: Ticker::new(config.bucket.find_self_interval, now),
            pieces: PieceRebuilder::new(config.send.piece_timeout.as_millis() as u64),
            config,
            clock,
            local,
            sender,
            services,
            tasks: TaskRegistry::new(),
            listeners: HashMap::new(),
            next_listener: 0,
            seen_broadcasts: HashMap::new(),
            next_event_id: rand::random(),
            start_time: now,
            stopped: false,
        })
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    /// The root routing table.
    pub fn routing(&self) -> &RoutingTable {
        &self.root().routing
    }

    /// The root value table.
    pub fn values(&self) -> &DistributedValueTable {
        &self.root().values
    }

    pub fn stats(&self) -> SendStats {
        self.sender.stats()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Earliest time [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> u64 {
        self.refresh.next_deadline().min(self.wake.next_deadline())
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn root(&self) -> &ServiceTable {
        // The root table is created in `new` and never removed.
        &self.services[&ServicePath::root()]
    }

    fn check_running(&self) -> Result<(), DhtError> {
        if self.stopped {
            Err(DhtError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Pushes the current local identity to the sender.
    fn sync_local(&mut self) {
        self.sender.set_local(self.local.clone());
    }

    /// Creates, starts and registers a task bound to `service`.
    fn spawn<R>(
        &mut self,
        service: &ServicePath,
        build: impl FnOnce(&mut TaskContext<'_>, u32) -> (AnyTask, R),
    ) -> Result<R, DhtError> {
        let id = self.tasks.allocate_id();
        let now = self.now();
        let table = self
            .services
            .get_mut(service)
            .ok_or_else(|| DhtError::ServiceNotFound(service.to_string()))?;
        let mut ctx = TaskContext {
            now,
            config: &self.config,
            local: &self.local,
            service,
            routing: &mut table.routing,
            values: &mut table.values,
            sender: &mut self.sender,
        };
        let (mut task, out) = build(&mut ctx, id);
        task.as_task_mut().start(&mut ctx);
        if !task.as_task().is_finished() {
            self.tasks.insert(task);
        }
        self.flush_oversized();
        Ok(out)
    }

    /// Runs `f` against a live task with a context for its service. Tasks
    /// whose service table went away are aborted instead.
    fn drive(&mut self, id: u32, f: impl FnOnce(&mut AnyTask, &mut TaskContext<'_>)) {
        let Some(mut task) = self.tasks.take(id) else {
            return;
        };
        let now = self.now();
        let service = task.as_task().base().service().clone();
        let orphaned = !self.services.contains_key(&service);
        let key = if orphaned { ServicePath::root() } else { service.clone() };
        let Some(table) = self.services.get_mut(&key) else {
            return;
        };
        let mut ctx = TaskContext {
            now,
            config: &self.config,
            local: &self.local,
            service: &service,
            routing: &mut table.routing,
            values: &mut table.values,
            sender: &mut self.sender,
        };
        if orphaned {
            task.as_task_mut().abort(&mut ctx, ResultCode::Abort);
        } else {
            f(&mut task, &mut ctx);
        }
        if !task.as_task().is_finished() {
            self.tasks.insert(task);
        }
        self.flush_oversized();
    }

    /// Starts a split task for every package the sender found too large.
    fn flush_oversized(&mut self) {
        for oversized in self.sender.take_oversized() {
            let service = if self.services.contains_key(&oversized.service) {
                oversized.service.clone()
            } else {
                ServicePath::root()
            };
            trace!(
                "splitting {} bytes to {}",
                oversized.data.len(),
                oversized.dest.peerid()
            );
            let _ = self.spawn(&service, |ctx, id| {
                let (task, rx) = SplitPackageTask::new(ctx, id, oversized);
                (AnyTask::Split(task), rx)
            });
        }
    }

    fn abort_tasks(&mut self, result: ResultCode, matches: impl Fn(&ServicePath) -> bool) {
        for id in self.tasks.ids() {
            let hit = self
                .tasks
                .get(id)
                .is_some_and(|t| matches(t.as_task().base().service()));
            if hit {
                self.drive(id, |task, ctx| task.as_task_mut().abort(ctx, result));
            }
        }
    }

    /// Merges `peer` into the root table and every service table it belongs
    /// to; returns the merged view.
    ///
    /// When the view comes from the peer itself (`received`), tables of
    /// services it no longer serves drop it.
    pub(crate) fn activate(&mut self, peer: Peer, sent: bool, received: bool, trusted: bool) -> Peer {
        let now = self.now();
        let peerid = peer.peerid().to_string();
        let root = ServicePath::root();

        let view = match self.services.get_mut(&root) {
            Some(table) => {
                if let Some(result) = table
                    .routing
                    .active_peer(peer.clone(), now, sent, received, trusted)
                {
                    for evicted in &result.evicted {
                        trace!("peer {} evicted by {}", evicted.peerid(), peerid);
                    }
                }
                table.routing.find_peer(&peerid).cloned()
            }
            None => None,
        };
        let view = view.unwrap_or(peer);

        for (path, table) in self.services.iter_mut().filter(|(p, _)| !p.is_root()) {
            if view.is_member_of(path) {
                table.routing.active_peer(view.clone(), now, false, false, true);
            } else if received && table.routing.remove_peer(&peerid).is_some() {
                debug!("peer {} left service {}", peerid, path);
            }
        }
        view
    }

    /// Reports contact with a peer known out of band, e.g. a bootstrap node.
    pub fn active_peer(
        &mut self,
        info: PeerInfo,
        address: Option<Endpoint>,
        sent: bool,
        received: bool,
    ) -> Result<(), DhtError> {
        self.check_running()?;
        PeerInfo::validate_peerid(&info.peerid)?;
        if info.peerid == self.local.peerid() {
            return Err(DhtError::InvalidArgs("cannot activate the local peer".into()));
        }
        let peer = Peer::new(info).with_address(address);
        self.activate(peer, sent, received, false);
        Ok(())
    }

    /// Sends a `PING_REQ` to a known peer.
    pub fn ping(&mut self, peerid: &str) -> Result<(), DhtError> {
        self.check_running()?;
        let peer = self
            .routing()
            .find_peer(peerid)
            .cloned()
            .ok_or_else(|| DhtError::InvalidArgs(format!("unknown peer {}", peerid)))?;
        self.send_ping(&peer);
        Ok(())
    }

    fn send_ping(&mut self, peer: &Peer) {
        let now = self.now();
        let opts = PackageOptions::default();
        self.sender.send(now, peer, Body::PingReq, &opts);
        for table in self.services.values_mut() {
            table.routing.touch_sent(peer.peerid(), now);
        }
    }

    pub fn find_peer(&mut self, peerid: &str) -> Result<Completion<FindPeerResult>, DhtError> {
        self.find_peer_in(&ServicePath::root(), peerid)
    }

    pub fn save_value(
        &mut self,
        table: &str,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<Completion<SaveValueResult>, DhtError> {
        self.save_value_in(&ServicePath::root(), table, key, value.into())
    }

    pub fn get_value(&mut self, table: &str, key: &str) -> Result<Completion<GetValueResult>, DhtError> {
        self.get_value_in(&ServicePath::root(), table, key)
    }

    pub fn delete_value(&mut self, table: &str, key: &str) -> Result<bool, DhtError> {
        self.delete_value_in(&ServicePath::root(), table, key)
    }

    pub fn emit_broadcast_event(
        &mut self,
        name: &str,
        params: impl Into<Bytes>,
        min_arrivals: usize,
    ) -> Result<Completion<BroadcastResult>, DhtError> {
        self.emit_broadcast_event_in(&ServicePath::root(), name, params.into(), min_arrivals)
    }

    pub fn attach_broadcast_event_listener(
        &mut self,
        name: &str,
    ) -> (ListenerId, mpsc::UnboundedReceiver<BroadcastEvent>) {
        self.attach_listener(&ServicePath::root(), name)
    }

    pub fn detach_broadcast_event_listener(&mut self, name: &str, id: ListenerId) -> bool {
        self.detach_listener(&ServicePath::root(), name, id)
    }

    /// Punches a hole toward `target`, optionally through `agency`.
    pub fn handshake(
        &mut self,
        target: PeerInfo,
        agency: Option<PeerInfo>,
    ) -> Result<Completion<HandshakeResult>, DhtError> {
        self.check_running()?;
        PeerInfo::validate_peerid(&target.peerid)?;
        if target.peerid == self.local.peerid() {
            return Err(DhtError::InvalidArgs("cannot handshake with the local peer".into()));
        }
        if self.tasks.source(&target.peerid).is_some() {
            return Err(DhtError::InvalidArgs(format!(
                "handshake with {} already running",
                target.peerid
            )));
        }
        let target = self.known_or_new(target);
        let agency = match agency {
            Some(info) => {
                PeerInfo::validate_peerid(&info.peerid)?;
                Some(self.known_or_new(info))
            }
            None => None,
        };
        self.spawn(&ServicePath::root(), |ctx, id| {
            let (task, rx) = HandshakeSource::new(ctx, id, target, agency);
            (AnyTask::Source(task), rx)
        })
    }

    fn known_or_new(&self, info: PeerInfo) -> Peer {
        let incoming = Peer::new(info);
        match self.routing().find_peer(incoming.peerid()) {
            Some(known) => {
                let mut peer = known.clone();
                peer.update(&incoming, false, false);
                peer
            }
            None => incoming,
        }
    }

    pub fn service(&self, path: &ServicePath) -> Option<&ServiceTable> {
        self.services.get(path)
    }

    /// Paths of every service table, the root first.
    pub fn service_paths(&self) -> impl Iterator<Item = &ServicePath> {
        self.services.keys()
    }

    pub fn find_peer_in(
        &mut self,
        service: &ServicePath,
        peerid: &str,
    ) -> Result<Completion<FindPeerResult>, DhtError> {
        self.check_running()?;
        PeerInfo::validate_peerid(peerid)?;
        self.spawn(service, |ctx, id| {
            let (task, rx) = FindPeerTask::new(ctx, id, peerid);
            (AnyTask::FindPeer(task), rx)
        })
    }

    /// Stores the value locally as owned, then replicates it to the peers
    /// closest to the table.
    pub fn save_value_in(
        &mut self,
        service: &ServicePath,
        table: &str,
        key: &str,
        value: Bytes,
    ) -> Result<Completion<SaveValueResult>, DhtError> {
        self.check_running()?;
        DistributedValueTable::validate(table, key, false)?;
        self.check_value_len(service, table, key, &value)?;
        let now = self.now();
        self.services
            .get_mut(service)
            .ok_or_else(|| DhtError::ServiceNotFound(service.to_string()))?
            .values
            .save_owned(table, key, value.clone(), now)?;
        self.spawn(service, |ctx, id| {
            let (task, rx) = SaveValueTask::new(ctx, id, table, key, value);
            (AnyTask::SaveValue(task), rx)
        })
    }

    /// Rejects values whose `UPDATE_VALUE_REQ` could not be carried, not even
    /// split into pieces. Sized against the longest possible destination.
    pub(crate) fn check_value_len(
        &self,
        service: &ServicePath,
        table: &str,
        key: &str,
        value: &Bytes,
    ) -> Result<(), DhtError> {
        let piece_size = SplitPackageTask::piece_size(self.config.protocol.mtu, self.local.peerid());
        let limit = (MAX_PIECE_COUNT as usize * piece_size).min(u16::MAX as usize);

        let body = Body::UpdateValueReq {
            table: table.to_string(),
            key: key.to_string(),
            value: value.clone(),
        };
        let common = CommonSection {
            src: self.local.info().clone(),
            dest_peerid: "x".repeat(MAX_PEERID_LENGTH),
            dest_ep: Some(Endpoint::udp(SocketAddr::from((Ipv6Addr::from([0xffff; 8]), u16::MAX)))),
            nodes: Vec::new(),
            task_id: Some(u32::MAX),
            service: service.clone(),
        };
        let len = HEADER_LENGTH + encoded_len(&body.to_value()) + encoded_len(&common.to_value(0));
        if len > limit {
            return Err(DhtError::InvalidArgs(format!(
                "value of {} bytes does not fit in a package ({} > {})",
                value.len(),
                len,
                limit
            )));
        }
        Ok(())
    }

    pub fn get_value_in(
        &mut self,
        service: &ServicePath,
        table: &str,
        key: &str,
    ) -> Result<Completion<GetValueResult>, DhtError> {
        self.check_running()?;
        DistributedValueTable::validate(table, key, true)?;
        self.spawn(service, |ctx, id| {
            let (task, rx) = GetValueTask::new(ctx, id, table, key);
            (AnyTask::GetValue(task), rx)
        })
    }

    /// Removes a value from the local table only; replicas expire on their own.
    pub fn delete_value_in(&mut self, service: &ServicePath, table: &str, key: &str) -> Result<bool, DhtError> {
        self.check_running()?;
        DistributedValueTable::validate(table, key, false)?;
        let values = &mut self
            .services
            .get_mut(service)
            .ok_or_else(|| DhtError::ServiceNotFound(service.to_string()))?
            .values;
        Ok(values.delete_value(table, key))
    }

    pub fn emit_broadcast_event_in(
        &mut self,
        service: &ServicePath,
        name: &str,
        params: Bytes,
        min_arrivals: usize,
    ) -> Result<Completion<BroadcastResult>, DhtError> {
        self.check_running()?;
        if name.is_empty() {
            return Err(DhtError::InvalidArgs("empty event name".into()));
        }
        if !self.services.contains_key(service) {
            return Err(DhtError::ServiceNotFound(service.to_string()));
        }
        self.next_event_id = self.next_event_id.wrapping_add(1);
        let event = BroadcastEvent {
            name: name.to_string(),
            params,
            origin: self.local.peerid().to_string(),
            event_id: self.next_event_id,
            service: service.clone(),
        };
        self.mark_seen(&event.origin, event.event_id);
        debug!("emitting {} #{} in {}", event.name, event.event_id, service);
        self.spawn(service, |ctx, id| {
            let (task, rx) = BroadcastTask::emit(ctx, id, event, min_arrivals);
            (AnyTask::Broadcast(task), rx)
        })
    }

    pub(crate) fn attach_listener(
        &mut self,
        service: &ServicePath,
        name: &str,
    ) -> (ListenerId, mpsc::UnboundedReceiver<BroadcastEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_listener += 1;
        let id = self.next_listener;
        self.listeners
            .entry((service.clone(), name.to_string()))
            .or_default()
            .push((id, tx));
        (id, rx)
    }

    pub(crate) fn detach_listener(&mut self, service: &ServicePath, name: &str, id: ListenerId) -> bool {
        let key = (service.clone(), name.to_string());
        let Some(list) = self.listeners.get_mut(&key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.listeners.remove(&key);
        }
        removed
    }

    /// Hands an event to the listeners of its service and name, dropping
    /// listeners whose receiver is gone.
    fn deliver_event(&mut self, event: &BroadcastEvent) {
        let key = (event.service.clone(), event.name.clone());
        let Some(list) = self.listeners.get_mut(&key) else {
            return;
        };
        list.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        if list.is_empty() {
            self.listeners.remove(&key);
        }
    }

    fn mark_seen(&mut self, origin: &str, event_id: u32) {
        let ttl = self.config.broadcast.timeout.as_millis() as u64 * 2;
        let expires = self.now() + ttl;
        self.seen_broadcasts
            .insert((origin.to_string(), event_id), expires);
    }

    /// Creates the table for `path` and its ancestors if missing.
    pub fn prepare_service_dht(&mut self, path: &ServicePath) -> Result<(), DhtError> {
        self.check_running()?;
        for p in path.lineage().collect::<Vec<_>>() {
            self.ensure_service(&p, ServiceRole::Prepared);
        }
        Ok(())
    }

    /// The operations of an existing service table.
    pub fn find_service_dht(&mut self, path: &ServicePath) -> Option<ServiceDht<'_>> {
        if !self.services.contains_key(path) {
            return None;
        }
        Some(ServiceDht {
            dht: self,
            path: path.clone(),
        })
    }

    fn ensure_service(&mut self, path: &ServicePath, role: ServiceRole) {
        if let Some(table) = self.services.get_mut(path) {
            let upgrade = match (table.role(), role) {
                (ServiceRole::Root, _) => false,
                (_, ServiceRole::Server) => true,
                (ServiceRole::Prepared, ServiceRole::Visitor) => true,
                _ => false,
            };
            if upgrade {
                table.set_role(role);
            }
            return;
        }

        let now = self.now();
        let mut table = ServiceTable::new(path.clone(), role, self.local.peerid(), &self.config);
        let members: Vec<Peer> = self
            .routing()
            .peers()
            .filter(|p| p.is_member_of(path))
            .cloned()
            .collect();
        for peer in members {
            table.routing.active_peer(peer, now, false, false, true);
        }
        debug!(
            "service table {} created as {:?} with {} peers",
            path,
            role,
            table.routing.len()
        );
        self.services.insert(path.clone(), table);
    }

    /// Serves `path`: its table becomes a server table, the ancestors are
    /// prepared and the local peer advertises the path from now on.
    pub fn signin_server(&mut self, path: &ServicePath, info: BTreeMap<String, String>) -> Result<(), DhtError> {
        self.check_running()?;
        if path.is_root() {
            return Err(DhtError::InvalidArgs("cannot sign in to the root".into()));
        }
        for p in path.lineage().collect::<Vec<_>>() {
            let role = if &p == path {
                ServiceRole::Server
            } else {
                ServiceRole::Prepared
            };
            self.ensure_service(&p, role);
        }
        self.local.info_mut().services.insert(
            path.clone(),
            ServiceDescriptor {
                flags: SERVICE_FLAG_SERVER,
                info,
            },
        );
        self.sync_local();
        info!("signed in as server of {}", path);
        self.announce();
        Ok(())
    }

    /// Stops serving `path` and every path below it.
    pub fn signout_server(&mut self, path: &ServicePath) -> Result<(), DhtError> {
        self.check_running()?;
        if path.is_root() {
            return Err(DhtError::InvalidArgs("cannot sign out of the root".into()));
        }
        if !self.local.services().keys().any(|sp| path.contains(sp)) {
            return Err(DhtError::ServiceNotFound(path.to_string()));
        }
        self.local
            .info_mut()
            .services
            .retain(|sp, _| !path.contains(sp));
        self.sync_local();

        let removed: Vec<ServicePath> = self
            .services
            .keys()
            .filter(|p| path.contains(p))
            .cloned()
            .collect();
        for p in &removed {
            self.remove_service(p);
        }
        self.prune_ancestors(path);
        info!("signed out of {}", path);
        self.announce();
        Ok(())
    }

    /// Uses `path` without advertising it.
    pub fn signin_visitor(&mut self, path: &ServicePath) -> Result<(), DhtError> {
        self.check_running()?;
        if path.is_root() {
            return Err(DhtError::InvalidArgs("cannot sign in to the root".into()));
        }
        for p in path.lineage().collect::<Vec<_>>() {
            let role = if &p == path {
                ServiceRole::Visitor
            } else {
                ServiceRole::Prepared
            };
            self.ensure_service(&p, role);
        }
        Ok(())
    }

    pub fn signout_visitor(&mut self, path: &ServicePath) -> Result<(), DhtError> {
        self.check_running()?;
        match self.services.get(path).map(|t| t.role()) {
            Some(ServiceRole::Visitor) => {}
            _ => return Err(DhtError::ServiceNotFound(path.to_string())),
        }
        if self.has_descendants(path) {
            if let Some(table) = self.services.get_mut(path) {
                table.set_role(ServiceRole::Prepared);
            }
        } else {
            self.remove_service(path);
        }
        self.prune_ancestors(path);
        Ok(())
    }

    fn has_descendants(&self, path: &ServicePath) -> bool {
        self.services.keys().any(|p| p != path && path.contains(p))
    }

    /// Walks up from `path`, dropping prepared tables nothing depends on.
    fn prune_ancestors(&mut self, path: &ServicePath) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if p.is_root() {
                break;
            }
            let prepared = self
                .services
                .get(&p)
                .is_some_and(|t| t.role() == ServiceRole::Prepared);
            let advertised = self.local.services().keys().any(|sp| p.contains(sp));
            if !prepared || advertised || self.has_descendants(&p) {
                break;
            }
            self.remove_service(&p);
            parent = p.parent();
        }
    }

    fn remove_service(&mut self, path: &ServicePath) {
        if path.is_root() || self.services.remove(path).is_none() {
            return;
        }
        debug!("service table {} removed", path);
        self.abort_tasks(ResultCode::Abort, |p| p == path);
        self.listeners.retain(|(p, _), _| p != path);
    }

    /// Lets a sample of the root table see the new local service set.
    fn announce(&mut self) {
        let count = self.config.bucket.bucket_size;
        let peers: Vec<Peer> = self
            .routing()
            .get_random_peers(count, |p| p.is_reachable())
            .into_iter()
            .cloned()
            .collect();
        for peer in &peers {
            self.send_ping(peer);
        }
    }

    /// Runs whatever periodic work is due.
    pub fn poll(&mut self) {
        if self.stopped {
            return;
        }
        let now = self.now();
        if self.refresh.due(now) {
            self.refresh();
        }
        if self.wake.due(now) {
            self.wake_tasks();
        }
    }

    /// Peer and value housekeeping.
    pub fn refresh(&mut self) {
        let now = self.now();
        let online = (now.saturating_sub(self.start_time) / 1000) as u32;
        self.local.set_online_duration(online);
        self.sync_local();

        for (path, table) in self.services.iter_mut() {
            for peer in table.routing.timeout_peers(now) {
                debug!("peer {} timed out of {}", peer.peerid(), path);
            }
            let dropped = table.values.knock_out(now);
            if dropped > 0 {
                trace!("{} values expired in {}", dropped, path);
            }
        }

        self.drop_lossy_peers(now);

        let interval = self.config.bucket.ping_interval.as_millis() as u64;
        let limit = self.config.bucket.max_pings_per_tick;
        let idle = self.routing().peers_to_ping(now, interval, limit);
        for peer in &idle {
            self.send_ping(peer);
        }

        self.sender.prune(now);
        self.pieces.knock_out(now);
        self.seen_broadcasts.retain(|_, expires| *expires > now);

        if self.republish.due(now) {
            self.republish_values();
        }
        if self.find_self.due(now) {
            self.find_self();
        }
    }

    /// Drops peers that went silent while most requests to them were lost,
    /// ahead of the peer timeout.
    fn drop_lossy_peers(&mut self, now: u64) {
        let idle = self.config.bucket.ping_interval.as_millis() as u64;
        let max_loss = self.config.bucket.max_packet_loss;
        let lossy: Vec<String> = self
            .routing()
            .peers()
            .filter(|p| now.saturating_sub(p.last_active_time()) > idle)
            .filter(|p| {
                self.sender
                    .packet_loss(p.peerid(), now)
                    .is_some_and(|loss| loss >= max_loss)
            })
            .map(|p| p.peerid().to_string())
            .collect();
        for peerid in lossy {
            debug!("peer {} dropped for packet loss", peerid);
            for table in self.services.values_mut() {
                table.routing.remove_peer(&peerid);
            }
        }
    }

    /// Gives every task its periodic chance to resend or time out.
    pub fn wake_tasks(&mut self) {
        for id in self.tasks.ids() {
            self.drive(id, |task, ctx| task.as_task_mut().tick(ctx));
        }
    }

    fn republish_values(&mut self) {
        let owned: Vec<(ServicePath, String, String, Bytes)> = self
            .services
            .iter()
            .flat_map(|(path, table)| {
                table.values.owned_values().map(move |(t, k, v)| {
                    (path.clone(), t.to_string(), k.to_string(), v.clone())
                })
            })
            .collect();
        if !owned.is_empty() {
            debug!("republishing {} owned values", owned.len());
        }
        for (path, table, key, value) in owned {
            let _ = self.spawn(&path, |ctx, id| {
                let (task, rx) = SaveValueTask::new(ctx, id, &table, &key, value);
                (AnyTask::SaveValue(task), rx)
            });
        }
    }

    /// Looks up the local id while the root table is sparse, which fills
    /// the buckets nearest to us.
    fn find_self(&mut self) {
        let routing = self.routing();
        if routing.is_empty() || routing.len() >= self.config.bucket.bucket_size {
            return;
        }
        let local = self.local.peerid().to_string();
        let _ = self.spawn(&ServicePath::root(), |ctx, id| {
            let (task, rx) = FindPeerTask::new(ctx, id, &local);
            (AnyTask::FindPeer(task), rx)
        });
    }

    /// Aborts every task with `Stopped` and refuses further work.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.abort_tasks(ResultCode::Stopped, |_| true);
        self.stopped = true;
        info!("dht {} stopped", self.local.peerid());
    }

    /// Peers of `service` closest to `target`, as neighbor hints.
    fn closer_hints(&self, service: &ServicePath, target: &str, exclude: &str) -> Vec<PeerInfo> {
        let Some(table) = self.services.get(service) else {
            return Vec::new();
        };
        table
            .routing
            .find_closest_peers_filtered(
                hash_peerid(target),
                self.config.task.max_closer_hints,
                None,
                |p| p.peerid() != exclude && p.is_reachable(),
            )
            .into_iter()
            .map(Peer::to_hint)
            .collect()
    }

    fn observed_local_address(&mut self, ep: Endpoint) {
        if self.local.address() != Some(ep) {
            debug!("local address observed as {}", ep);
            self.local.set_address(Some(ep));
            self.sync_local();
        }
    }
}
