//! Package wire format.
//!
//! Every datagram starts with a fixed 36-byte little-endian [`PackageHeader`],
//! followed by a bencoded body dictionary specific to the [`Command`] and, for
//! all commands except piece carriers and combined packages, a bencoded
//! [`CommonSection`] describing sender and destination.
//!
//! ```text
//! +------------------+------------------+---------------------------+
//! | header (36 bytes)| body (body_len)  | common section / payload  |
//! +------------------+------------------+---------------------------+
//! |<-------------------------- total_len -------------------------->|
//! ```
//!
//! Even command values are responses. Decoding rejects foreign deployments
//! (magic, version, app id), inconsistent lengths and packages whose
//! `src_hash` does not match the hash of the claimed sender id.

mod body;
mod codec;
mod command;
mod common;
mod error;
mod header;

pub use body::Body;
pub use codec::{Package, PackageCodec};
pub use command::Command;
pub use common::CommonSection;
pub use error::ProtocolError;
pub use header::PackageHeader;

#[cfg(test)]
mod tests;
