use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Dht, DhtError, ListenerId};
use crate::config::DhtConfig;
use crate::peer::ServicePath;
use crate::routing::RoutingTable;
use crate::task::{
    BroadcastEvent, BroadcastResult, Completion, FindPeerResult, GetValueResult, SaveValueResult,
};
use crate::value_table::DistributedValueTable;

/// Why a service table exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    /// The root DHT.
    Root,
    /// Created on demand, or as the ancestor of a signed-in service.
    Prepared,
    /// The local peer serves this path and advertises it.
    Server,
    /// The local peer uses this path without advertising it.
    Visitor,
}

/// Routing and value state of one service path.
pub struct ServiceTable {
    path: ServicePath,
    role: ServiceRole,
    pub(crate) routing: RoutingTable,
    pub(crate) values: DistributedValueTable,
}

impl ServiceTable {
    pub(crate) fn new(path: ServicePath, role: ServiceRole, local_peerid: &str, config: &DhtConfig) -> Self {
        Self {
            path,
            role,
            routing: RoutingTable::new(local_peerid, &config.bucket),
            values: DistributedValueTable::new(&config.value),
        }
    }

    pub fn path(&self) -> &ServicePath {
        &self.path
    }

    pub fn role(&self) -> ServiceRole {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: ServiceRole) {
        self.role = role;
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn values(&self) -> &DistributedValueTable {
        &self.values
    }
}

/// The DHT operations scoped to one service path.
pub struct ServiceDht<'a> {
    pub(crate) dht: &'a mut Dht,
    pub(crate) path: ServicePath,
}

impl ServiceDht<'_> {
    pub fn path(&self) -> &ServicePath {
        &self.path
    }

    pub fn table(&self) -> Option<&ServiceTable> {
        self.dht.service(&self.path)
    }

    pub fn find_peer(&mut self, peerid: &str) -> Result<Completion<FindPeerResult>, DhtError> {
        self.dht.find_peer_in(&self.path, peerid)
    }

    pub fn save_value(
        &mut self,
        table: &str,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<Completion<SaveValueResult>, DhtError> {
        self.dht.save_value_in(&self.path, table, key, value.into())
    }

    pub fn get_value(&mut self, table: &str, key: &str) -> Result<Completion<GetValueResult>, DhtError> {
        self.dht.get_value_in(&self.path, table, key)
    }

    pub fn delete_value(&mut self, table: &str, key: &str) -> Result<bool, DhtError> {
        self.dht.delete_value_in(&self.path, table, key)
    }

    pub fn emit_broadcast_event(
        &mut self,
        name: &str,
        params: impl Into<Bytes>,
        min_arrivals: usize,
    ) -> Result<Completion<BroadcastResult>, DhtError> {
        self.dht
            .emit_broadcast_event_in(&self.path, name, params.into(), min_arrivals)
    }

    pub fn attach_broadcast_event_listener(
        &mut self,
        name: &str,
    ) -> (ListenerId, mpsc::UnboundedReceiver<BroadcastEvent>) {
        self.dht.attach_listener(&self.path, name)
    }

    pub fn detach_broadcast_event_listener(&mut self, name: &str, id: ListenerId) -> bool {
        self.dht.detach_listener(&self.path, name, id)
    }

    pub fn signin_server(&mut self, info: BTreeMap<String, String>) -> Result<(), DhtError> {
        self.dht.signin_server(&self.path, info)
    }

    pub fn signout_server(&mut self) -> Result<(), DhtError> {
        self.dht.signout_server(&self.path)
    }
}
