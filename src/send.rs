//! Outbound path: envelopes, retries and telemetry.
//!
//! [`PackageSender`] is the per-DHT context that owns the transport, the
//! sequence counter, the [`ResendRegistry`] and the [`SendStat`] counters, so
//! two DHT instances in one process never share state.

mod resend;
mod sender;
mod stat;
mod transport;

pub use resend::{ResendController, ResendId, ResendRegistry, ResendState};
pub use sender::{Oversized, PackageOptions, PackageSender};
pub use stat::{Counter, SendStat, SendStats};
pub use transport::{select_candidates, SendOptions, Transport};
