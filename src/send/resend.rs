use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, trace};

use super::stat::SendStat;
use super::transport::{SendOptions, Transport};
use crate::config::SendConfig;
use crate::peer::{Endpoint, Protocol};

pub type ResendId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendState {
    /// A datagram went out during this call.
    Sent,
    /// Backing off; nothing was sent.
    Waiting,
    /// Every try was used and the last one went unanswered.
    Exhausted,
    /// No controller is registered under the id; it was answered or released.
    Finished,
}

/// Retry schedule of one outbound datagram with exponential backoff.
#[derive(Debug)]
pub struct ResendController {
    peerid: String,
    dests: Vec<Endpoint>,
    data: Bytes,
    seq: u32,
    tries: u32,
    max_tries: u32,
    interval: u64,
    try_alternate: bool,
    create_time: u64,
    last_send: u64,
    traced: bool,
}

impl ResendController {
    pub fn new(
        peerid: &str,
        dests: Vec<Endpoint>,
        data: Bytes,
        seq: u32,
        config: &SendConfig,
        now: u64,
    ) -> Self {
        Self {
            peerid: peerid.to_string(),
            dests,
            data,
            seq,
            tries: 0,
            max_tries: config.resend_max_tries.max(1),
            interval: (config.resend_interval.as_millis() as u64).max(1),
            try_alternate: config.try_alternate,
            create_time: now,
            last_send: 0,
            traced: true,
        }
    }

    /// Keeps the first send out of RTT sampling and loss attribution, as
    /// for responses.
    pub fn untraced(mut self) -> Self {
        self.traced = false;
        self
    }

    pub fn peerid(&self) -> &str {
        &self.peerid
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Wait after the latest try: `interval * 2^(tries - 1)`.
    pub fn backoff(&self) -> u64 {
        self.interval << self.tries.saturating_sub(1).min(16)
    }

    pub fn is_timeout(&self, now: u64) -> bool {
        self.tries >= self.max_tries && now >= self.last_send + self.backoff()
    }

    /// Sends if the backoff since the previous try has elapsed.
    pub fn send(
        &mut self,
        now: u64,
        transport: &mut dyn Transport,
        stat: &mut SendStat,
    ) -> ResendState {
        if self.tries > 0 && now < self.last_send + self.backoff() {
            return ResendState::Waiting;
        }
        if self.tries >= self.max_tries {
            return ResendState::Exhausted;
        }

        let retry = self.tries > 0;
        let opts = SendOptions {
            protocol: Protocol::Udp,
            spread: retry,
        };
        self.transmit(&opts, transport, stat, now, !retry && self.traced);

        if retry && self.try_alternate {
            let alternate = SendOptions {
                protocol: opts.protocol.alternate(),
                spread: true,
            };
            self.transmit(&alternate, transport, stat, now, false);
        }

        if retry {
            trace!("resend #{} of seq {} to {}", self.tries, self.seq, self.peerid);
        }
        self.tries += 1;
        self.last_send = now;
        ResendState::Sent
    }

    fn transmit(
        &self,
        opts: &SendOptions,
        transport: &mut dyn Transport,
        stat: &mut SendStat,
        now: u64,
        track: bool,
    ) {
        if let Err(e) = transport.send(&self.dests, &self.data, opts) {
            debug!("send to {} failed: {}", self.peerid, e);
            return;
        }
        stat.on_send(&self.peerid, self.seq, track, opts.protocol, self.data.len(), now);
    }
}

/// All live resend controllers of one DHT.
#[derive(Debug)]
pub struct ResendRegistry {
    controllers: HashMap<ResendId, ResendController>,
    next_id: ResendId,
    high_water: usize,
    stale: u64,
}

impl ResendRegistry {
    pub fn new(config: &SendConfig) -> Self {
        Self {
            controllers: HashMap::new(),
            next_id: 1,
            high_water: config.resend_high_water,
            stale: config.resend_stale.as_millis() as u64,
        }
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn insert(&mut self, controller: ResendController) -> ResendId {
        let id = self.next_id;
        self.next_id += 1;
        self.controllers.insert(id, controller);
        id
    }

    pub fn get(&self, id: ResendId) -> Option<&ResendController> {
        self.controllers.get(&id)
    }

    pub fn get_mut(&mut self, id: ResendId) -> Option<&mut ResendController> {
        self.controllers.get_mut(&id)
    }

    pub fn remove(&mut self, id: ResendId) -> Option<ResendController> {
        self.controllers.remove(&id)
    }

    /// Shrinks the registry once it is above the high-water mark: timed-out
    /// and stale controllers go first, then any that already used
    /// more than two tries.
    pub fn prune(&mut self, now: u64) -> usize {
        if self.controllers.len() <= self.high_water {
            return 0;
        }
        let before = self.controllers.len();
        let stale = self.stale;
        self.controllers.retain(|_, c| {
            !(c.is_timeout(now) || now.saturating_sub(c.create_time) > stale)
        });
        if self.controllers.len() > self.high_water {
            self.controllers.retain(|_, c| c.tries <= 2);
        }
        let removed = before - self.controllers.len();
        debug!("pruned {} resend controllers", removed);
        removed
    }
}
