use std::io;

use crate::peer::{Endpoint, Protocol};

/// Per-send hints for the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub protocol: Protocol,
    /// Try every candidate instead of only the first usable one. Retries set
    /// this so that a stale live address does not hide the other endpoints.
    pub spread: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::Udp,
            spread: false,
        }
    }
}

/// The only I/O boundary of the core.
///
/// Implementations must not block: a datagram that cannot be queued is
/// dropped, and the resend logic above takes care of the rest.
pub trait Transport: Send {
    fn send(&mut self, dests: &[Endpoint], data: &[u8], opts: &SendOptions) -> io::Result<()>;
}

/// Candidates matching the requested protocol, in preference order.
pub fn select_candidates<'a>(
    dests: &'a [Endpoint],
    opts: &'a SendOptions,
) -> impl Iterator<Item = &'a Endpoint> + 'a {
    let limit = if opts.spread { dests.len() } else { 1 };
    dests
        .iter()
        .filter(move |ep| ep.protocol == opts.protocol)
        .take(limit)
}
