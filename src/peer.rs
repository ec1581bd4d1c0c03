//! Peer identity and bookkeeping.
//!
//! A peer is identified by an opaque string id. Its position in the XOR
//! keyspace is a 32-bit hash derived from that id, so a packet claiming an id
//! whose hash does not match the header is a spoof and is dropped by the codec.
//!
//! - [`PeerInfo`] is what travels on the wire: id, endpoints, advertised
//!   services and free-form info.
//! - [`Peer`] adds the local view: live address, send/receive timestamps,
//!   smoothed RTT, online duration and NAT classification.

mod endpoint;
mod error;
mod hash;
mod info;
mod service;

pub use endpoint::{Endpoint, Protocol};
pub use error::PeerError;
pub use hash::{distance, first_different_bit, hash_peerid, PeerHash};
pub use info::{NatType, Peer, PeerInfo};
pub use service::{ServiceDescriptor, ServicePath};

#[cfg(test)]
mod tests;
