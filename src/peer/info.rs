use std::collections::BTreeMap;

use super::endpoint::{Endpoint, Protocol};
use super::error::PeerError;
use super::hash::{hash_peerid, PeerHash};
use super::service::{ServiceDescriptor, ServicePath};
use crate::constants::{MAX_EP_COUNT, MAX_PEERID_LENGTH};

/// NAT classification reported in the packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum NatType {
    #[default]
    Unknown = 0,
    Public = 1,
    FullCone = 2,
    Restricted = 3,
    PortRestricted = 4,
    Symmetric = 5,
}

impl From<u8> for NatType {
    fn from(value: u8) -> Self {
        match value {
            1 => NatType::Public,
            2 => NatType::FullCone,
            3 => NatType::Restricted,
            4 => NatType::PortRestricted,
            5 => NatType::Symmetric,
            _ => NatType::Unknown,
        }
    }
}

/// The portion of a peer that is exchanged on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub peerid: String,
    pub eplist: Vec<Endpoint>,
    pub services: BTreeMap<ServicePath, ServiceDescriptor>,
    pub info: BTreeMap<String, String>,
}

impl PeerInfo {
    pub fn new(peerid: impl Into<String>) -> Self {
        Self {
            peerid: peerid.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, ep: Endpoint) -> Self {
        merge_eplist(&mut self.eplist, &[ep]);
        self
    }

    pub fn validate_peerid(peerid: &str) -> Result<(), PeerError> {
        if peerid.is_empty() || peerid.len() > MAX_PEERID_LENGTH {
            return Err(PeerError::InvalidPeerId(peerid.chars().take(32).collect()));
        }
        Ok(())
    }

    pub fn hash(&self) -> PeerHash {
        hash_peerid(&self.peerid)
    }
}

/// A known remote (or the local) peer.
#[derive(Debug, Clone)]
pub struct Peer {
    info: PeerInfo,
    hash: PeerHash,
    address: Option<Endpoint>,
    pub(crate) create_time: u64,
    last_send_time: u64,
    last_recv_time: u64,
    last_recv_time_udp: u64,
    rtt: u32,
    online_duration: u32,
    nat_type: NatType,
}

impl Peer {
    pub fn new(info: PeerInfo) -> Self {
        let hash = info.hash();
        Self {
            info,
            hash,
            address: None,
            create_time: 0,
            last_send_time: 0,
            last_recv_time: 0,
            last_recv_time_udp: 0,
            rtt: 0,
            online_duration: 0,
            nat_type: NatType::Unknown,
        }
    }

    pub fn with_address(mut self, address: Option<Endpoint>) -> Self {
        self.address = address;
        self
    }

    pub fn peerid(&self) -> &str {
        &self.info.peerid
    }

    pub fn hash(&self) -> PeerHash {
        self.hash
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn eplist(&self) -> &[Endpoint] {
        &self.info.eplist
    }

    pub fn services(&self) -> &BTreeMap<ServicePath, ServiceDescriptor> {
        &self.info.services
    }

    pub fn additional_info(&self) -> &BTreeMap<String, String> {
        &self.info.info
    }

    pub fn address(&self) -> Option<Endpoint> {
        self.address
    }

    pub fn set_address(&mut self, address: Option<Endpoint>) {
        self.address = address;
    }

    pub fn rtt(&self) -> u32 {
        self.rtt
    }

    pub fn online_duration(&self) -> u32 {
        self.online_duration
    }

    pub fn set_online_duration(&mut self, secs: u32) {
        self.online_duration = secs;
    }

    pub fn nat_type(&self) -> NatType {
        self.nat_type
    }

    pub fn set_nat_type(&mut self, nat_type: NatType) {
        self.nat_type = nat_type;
    }

    pub fn last_send_time(&self) -> u64 {
        self.last_send_time
    }

    pub fn last_recv_time(&self) -> u64 {
        self.last_recv_time
    }

    pub fn last_recv_time_udp(&self) -> u64 {
        self.last_recv_time_udp
    }

    /// A peer without any endpoint or live address cannot be sent to.
    pub fn is_reachable(&self) -> bool {
        self.address.is_some() || !self.info.eplist.is_empty()
    }

    /// Send candidates: the live address first, then the advertised endpoints.
    pub fn destinations(&self) -> Vec<Endpoint> {
        let mut eps = Vec::with_capacity(self.info.eplist.len() + 1);
        eps.extend(self.address);
        for ep in &self.info.eplist {
            if !eps.contains(ep) {
                eps.push(*ep);
            }
        }
        eps
    }

    /// Time of the last sign of life; a never-heard peer counts from creation.
    pub fn last_active_time(&self) -> u64 {
        self.last_recv_time.max(self.create_time)
    }

    pub fn is_timeout(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_active_time()) > timeout_ms
    }

    pub fn mark_sent(&mut self, now: u64) {
        self.last_send_time = self.last_send_time.max(now);
    }

    pub fn mark_received(&mut self, now: u64) {
        self.last_recv_time = self.last_recv_time.max(now);
        if matches!(self.address, Some(ep) if ep.protocol == Protocol::Udp) {
            self.last_recv_time_udp = self.last_recv_time_udp.max(now);
        }
    }

    /// Exponentially smoothed round-trip time.
    pub fn update_rtt(&mut self, sample: u32) {
        self.rtt = if self.rtt == 0 {
            sample
        } else {
            ((self.rtt as u64 * 7 + sample as u64) / 8) as u32
        };
    }

    /// True if the peer serves `path` or one of its descendants.
    pub fn is_member_of(&self, path: &ServicePath) -> bool {
        path.is_root() || self.info.services.keys().any(|sp| path.contains(sp))
    }

    /// Merges a newer view of the same peer into this one.
    ///
    /// Endpoints are unioned unless `trusted`, in which case the incoming list
    /// replaces ours. Service descriptors, NAT type and online duration are
    /// only taken from `authoritative` views, i.e. packets sent by the peer
    /// itself.
    pub fn update(&mut self, other: &Peer, trusted: bool, authoritative: bool) {
        debug_assert_eq!(self.info.peerid, other.info.peerid);

        if trusted && !other.info.eplist.is_empty() {
            self.info.eplist = other.info.eplist.clone();
            self.info.eplist.truncate(MAX_EP_COUNT);
        } else {
            merge_eplist(&mut self.info.eplist, &other.info.eplist);
        }

        if other.address.is_some() {
            self.address = other.address;
        }

        if authoritative || trusted {
            self.info.services = other.info.services.clone();
            self.online_duration = other.online_duration;
            self.nat_type = other.nat_type;
            if trusted {
                self.info.info = other.info.info.clone();
            } else {
                self.info
                    .info
                    .extend(other.info.info.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        self.last_send_time = self.last_send_time.max(other.last_send_time);
        self.last_recv_time = self.last_recv_time.max(other.last_recv_time);
        self.last_recv_time_udp = self.last_recv_time_udp.max(other.last_recv_time_udp);
        if other.rtt != 0 {
            self.update_rtt(other.rtt);
        }
    }

    /// Wire form used in neighbor hints: the live address leads the endpoint
    /// list because it is the one the recipient can most likely reach.
    pub fn to_hint(&self) -> PeerInfo {
        PeerInfo {
            peerid: self.info.peerid.clone(),
            eplist: self.destinations().into_iter().take(MAX_EP_COUNT).collect(),
            services: BTreeMap::new(),
            info: BTreeMap::new(),
        }
    }

    pub(crate) fn info_mut(&mut self) -> &mut PeerInfo {
        &mut self.info
    }
}

/// Puts `incoming` in front of `list`, dropping duplicates and capping the length.
pub(crate) fn merge_eplist(list: &mut Vec<Endpoint>, incoming: &[Endpoint]) {
    if incoming.is_empty() {
        return;
    }
    let mut merged: Vec<Endpoint> = Vec::with_capacity(list.len() + incoming.len());
    for ep in incoming.iter().chain(list.iter()) {
        if !merged.contains(ep) {
            merged.push(*ep);
        }
    }
    merged.truncate(MAX_EP_COUNT);
    *list = merged;
}
