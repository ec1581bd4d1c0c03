use bytes::Bytes;
use rand::Rng as _;
use tracing::debug;

use super::resend::{ResendController, ResendId, ResendRegistry, ResendState};
use super::stat::{SendStat, SendStats};
use super::transport::Transport;
use crate::config::{DhtConfig, SendConfig};
use crate::peer::{Peer, PeerInfo, ServicePath};
use crate::protocol::{Body, CommonSection, Package, PackageCodec, ProtocolError};

/// Envelope settings of one outgoing package.
#[derive(Debug, Clone, Default)]
pub struct PackageOptions {
    pub task_id: Option<u32>,
    pub service: ServicePath,
    pub ttl: u8,
    pub ack_seq: u32,
    pub nodes: Vec<PeerInfo>,
    /// Retry with backoff until finished or exhausted.
    pub reliable: bool,
}

/// An encoded package too large for one datagram, waiting to be split.
#[derive(Debug, Clone)]
pub struct Oversized {
    pub dest: Peer,
    pub data: Bytes,
    pub service: ServicePath,
}

/// Builds envelopes, encodes and hands packages to the transport.
pub struct PackageSender {
    codec: PackageCodec,
    transport: Box<dyn Transport>,
    config: SendConfig,
    local: Peer,
    seq: u32,
    stat: SendStat,
    resends: ResendRegistry,
    outbox: Vec<Oversized>,
}

impl PackageSender {
    pub fn new(config: &DhtConfig, transport: Box<dyn Transport>, local: Peer) -> Self {
        Self {
            codec: PackageCodec::new(&config.protocol),
            transport,
            config: config.send.clone(),
            local,
            seq: rand::rng().random(),
            stat: SendStat::new(),
            resends: ResendRegistry::new(&config.send),
            outbox: Vec::new(),
        }
    }

    pub fn codec(&self) -> &PackageCodec {
        &self.codec
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    /// Replaces the identity stamped on outgoing packages.
    pub fn set_local(&mut self, local: Peer) {
        self.local = local;
    }

    pub fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    pub fn build(&mut self, dest: &Peer, body: Body, opts: &PackageOptions) -> Package {
        let common = CommonSection {
            src: self.local.info().clone(),
            dest_peerid: dest.peerid().to_string(),
            dest_ep: dest.address().or_else(|| dest.eplist().first().copied()),
            nodes: opts.nodes.clone(),
            task_id: opts.task_id,
            service: opts.service.clone(),
        };
        Package {
            src_hash: self.local.hash(),
            src_online_duration: self.local.online_duration(),
            src_nat_type: self.local.nat_type(),
            dest_hash: dest.hash(),
            seq: self.next_seq(),
            ack_seq: opts.ack_seq,
            ttl: opts.ttl,
            body,
            common: Some(common),
        }
    }

    /// Sends `body` to `dest`. Returns the resend id of reliable sends.
    ///
    /// Packages above the MTU are parked in the outbox for splitting and
    /// `None` is returned; so is any package that cannot be sent at all.
    pub fn send(
        &mut self,
        now: u64,
        dest: &Peer,
        body: Body,
        opts: &PackageOptions,
    ) -> Option<ResendId> {
        if !dest.is_reachable() {
            debug!("no endpoint for {}", dest.peerid());
            return None;
        }
        let pkg = self.build(dest, body, opts);
        let data = match self.codec.encode(&pkg) {
            Ok(data) => data,
            Err(e) => {
                debug!("failed to encode {:?}: {}", pkg.command(), e);
                return None;
            }
        };

        if data.len() > self.codec.mtu() {
            self.outbox.push(Oversized {
                dest: dest.clone(),
                data,
                service: opts.service.clone(),
            });
            return None;
        }

        let request = !pkg.is_resp();
        self.send_bytes(now, dest, data, pkg.seq, opts.reliable && request, request)
    }

    /// Answers `req`, echoing its sequence number and correlation id.
    pub fn reply(&mut self, now: u64, to: &Peer, req: &Package, body: Body) {
        self.reply_with(now, to, req, body, Vec::new());
    }

    /// Like [`reply`](Self::reply), with neighbor hints in the common section.
    pub fn reply_with(
        &mut self,
        now: u64,
        to: &Peer,
        req: &Package,
        body: Body,
        nodes: Vec<PeerInfo>,
    ) {
        let opts = PackageOptions {
            task_id: req.task_id(),
            service: req
                .common
                .as_ref()
                .map(|c| c.service.clone())
                .unwrap_or_default(),
            ack_seq: req.seq,
            nodes,
            ..Default::default()
        };
        self.send(now, to, body, &opts);
    }

    /// Sends an already encoded datagram. Only requests are traced for loss.
    pub fn send_bytes(
        &mut self,
        now: u64,
        dest: &Peer,
        data: Bytes,
        seq: u32,
        reliable: bool,
        request: bool,
    ) -> Option<ResendId> {
        let mut controller =
            ResendController::new(dest.peerid(), dest.destinations(), data, seq, &self.config, now);
        if !request {
            controller = controller.untraced();
        }
        controller.send(now, self.transport.as_mut(), &mut self.stat);
        if reliable {
            Some(self.resends.insert(controller))
        } else {
            None
        }
    }

    pub fn encode(&self, pkg: &Package) -> Result<Bytes, ProtocolError> {
        self.codec.encode(pkg)
    }

    /// Gives a reliable send its next chance.
    pub fn resend(&mut self, id: ResendId, now: u64) -> ResendState {
        match self.resends.get_mut(id) {
            Some(c) => c.send(now, self.transport.as_mut(), &mut self.stat),
            None => ResendState::Finished,
        }
    }

    /// Unregisters a reliable send.
    pub fn cancel(&mut self, id: ResendId) {
        self.resends.remove(id);
    }

    pub fn take_oversized(&mut self) -> Vec<Oversized> {
        std::mem::take(&mut self.outbox)
    }

    /// Accounts an inbound datagram; returns an RTT sample when it acknowledges
    /// a tracked request.
    pub fn on_received(&mut self, peerid: &str, ack_seq: u32, len: usize, now: u64) -> Option<u32> {
        self.stat.on_recv(peerid, ack_seq, len, now)
    }

    pub fn packet_loss(&self, peerid: &str, now: u64) -> Option<f32> {
        let grace = (self.config.resend_interval.as_millis() as u64)
            << self.config.resend_max_tries.min(16);
        self.stat.packet_loss(peerid, now, grace)
    }

    pub fn pending_resends(&self) -> usize {
        self.resends.len()
    }

    /// Periodic housekeeping of the resend registry and statistics.
    pub fn prune(&mut self, now: u64) {
        self.resends.prune(now);
        self.stat
            .prune(now, self.config.resend_stale.as_millis() as u64);
    }

    pub fn stats(&self) -> SendStats {
        self.stat.snapshot()
    }
}
