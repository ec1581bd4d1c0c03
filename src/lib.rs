//! natdht - A Kademlia-style DHT overlay
//!
//! This library implements a peer-to-peer overlay for peer discovery, NAT
//! hole punching and small replicated key/value tables over UDP. Peers are
//! named by opaque string ids and placed in a 32-bit XOR keyspace.
//!
//! # Modules
//!
//! - [`bencode`] - Bencode encoding/decoding of package bodies
//! - [`peer`] - Peer ids, endpoints, service paths and per-peer bookkeeping
//! - [`routing`] - XOR bucket routing table with splitting and eviction
//! - [`value_table`] - Replicated value storage with expiry
//! - [`protocol`] - Wire format: 36-byte header, bodies and common section
//! - [`piece`] - Splitting and reassembly of oversized packages
//! - [`send`] - Outgoing envelopes, resends and send statistics
//! - [`task`] - Lookups, value convergence, broadcasts and handshakes
//! - [`dht`] - The orchestrator, service DHTs and the UDP server
//! - [`config`] - Tunables, with defaults from [`constants`]
//! - [`clock`] - Time sources and periodic deadlines

pub mod bencode;
pub mod clock;
pub mod config;
pub mod constants;
pub mod dht;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod routing;
pub mod send;
pub mod task;
pub mod value_table;

pub use bencode::{decode, encode, BencodeError, Value};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use config::DhtConfig;
pub use dht::{
    Dht, DhtError, DhtHandle, DhtServer, ListenerId, ResultCode, ServiceDht, ServiceRole,
    ServiceTable,
};
pub use peer::{Endpoint, NatType, Peer, PeerError, PeerInfo, ServicePath};
pub use protocol::{Body, Command, Package, PackageCodec, ProtocolError};
pub use routing::RoutingTable;
pub use send::{SendStats, Transport};
pub use task::{
    BroadcastEvent, BroadcastResult, FindPeerResult, GetValueResult, HandshakeResult,
    SaveValueResult,
};
pub use value_table::DistributedValueTable;
