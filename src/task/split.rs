use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use super::{Completion, Task, TaskBase, TaskContext};
use crate::constants::{HEADER_LENGTH, MAX_PIECE_COUNT};
use crate::dht::ResultCode;
use crate::peer::Peer;
use crate::piece::split_payload;
use crate::protocol::{Body, Package};
use crate::send::{Oversized, ResendId, ResendState};

/// Room left for the piece body dictionary besides the sender's peer id.
const PIECE_BODY_OVERHEAD: usize = 64;

#[derive(Debug)]
struct Piece {
    payload: Bytes,
    resend: Option<ResendId>,
    acked: bool,
}

/// Carries one oversized package as a series of `PACKAGE_PIECE_REQ`s and
/// waits for every piece to be acknowledged.
pub struct SplitPackageTask {
    base: TaskBase,
    dest: Peer,
    pieces: Vec<Piece>,
    tx: Option<oneshot::Sender<ResultCode>>,
}

impl SplitPackageTask {
    pub fn new(ctx: &TaskContext<'_>, id: u32, oversized: Oversized) -> (Self, Completion<ResultCode>) {
        let (tx, rx) = oneshot::channel();
        let piece_size = Self::piece_size(ctx.sender.codec().mtu(), ctx.local.peerid());
        let pieces = split_payload(&oversized.data, piece_size)
            .into_iter()
            .map(|payload| Piece {
                payload,
                resend: None,
                acked: false,
            })
            .collect();
        let task = Self {
            base: TaskBase::new(
                id,
                oversized.service,
                ctx.now,
                ctx.config.task.timeout,
                None,
            ),
            dest: oversized.dest,
            pieces,
            tx: Some(tx),
        };
        (task, rx)
    }

    /// Payload bytes per piece for a sender with this peer id.
    pub fn piece_size(mtu: usize, peerid: &str) -> usize {
        mtu.saturating_sub(HEADER_LENGTH + PIECE_BODY_OVERHEAD + peerid.len())
            .max(1)
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn dest(&self) -> &Peer {
        &self.dest
    }

    fn send_piece(&mut self, ctx: &mut TaskContext<'_>, no: usize) -> bool {
        let body = Body::PackagePieceReq {
            task_id: self.base.id(),
            peerid: ctx.local.peerid().to_string(),
            max: (self.pieces.len() - 1) as u32,
            no: no as u32,
            payload: self.pieces[no].payload.clone(),
        };
        let mut pkg = Package::new(body, None);
        pkg.src_hash = ctx.local.hash();
        pkg.src_online_duration = ctx.local.online_duration();
        pkg.src_nat_type = ctx.local.nat_type();
        pkg.dest_hash = self.dest.hash();
        pkg.seq = ctx.sender.next_seq();

        let data = match ctx.sender.encode(&pkg) {
            Ok(data) => data,
            Err(e) => {
                debug!("failed to encode piece {} of task {}: {}", no, self.base.id(), e);
                return false;
            }
        };
        self.pieces[no].resend = ctx
            .sender
            .send_bytes(ctx.now, &self.dest, data, pkg.seq, true, true);
        self.pieces[no].resend.is_some()
    }
}

impl Task for SplitPackageTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn start(&mut self, ctx: &mut TaskContext<'_>) {
        if !self.base.start(ctx.now) {
            return;
        }
        if self.pieces.is_empty() || self.pieces.len() > MAX_PIECE_COUNT as usize {
            debug!(
                "cannot split {} pieces for {}",
                self.pieces.len(),
                self.dest.peerid()
            );
            self.complete(ctx, ResultCode::Failed);
            return;
        }
        for no in 0..self.pieces.len() {
            if !self.send_piece(ctx, no) {
                self.complete(ctx, ResultCode::Failed);
                return;
            }
        }
    }

    fn process(&mut self, ctx: &mut TaskContext<'_>, pkg: &Package, from: &Peer) {
        if !self.base.is_running() || from.peerid() != self.dest.peerid() {
            return;
        }
        let Body::PackagePieceResp { no, .. } = pkg.body else {
            return;
        };
        let Some(piece) = self.pieces.get_mut(no as usize) else {
            return;
        };
        self.base.touch(ctx.now);
        if !piece.acked {
            piece.acked = true;
            if let Some(id) = piece.resend.take() {
                ctx.sender.cancel(id);
            }
        }
        if self.pieces.iter().all(|p| p.acked) {
            self.complete(ctx, ResultCode::Success);
        }
    }

    fn wake_up(&mut self, ctx: &mut TaskContext<'_>) {
        if !self.base.is_running() {
            return;
        }
        let mut exhausted = false;
        for piece in self.pieces.iter().filter(|p| !p.acked) {
            if let Some(id) = piece.resend {
                exhausted |= ctx.sender.resend(id, ctx.now) == ResendState::Exhausted;
            }
        }
        if exhausted {
            self.complete(ctx, ResultCode::Timeout);
        }
    }

    fn complete(&mut self, ctx: &mut TaskContext<'_>, result: ResultCode) {
        if !self.base.finish(result) {
            return;
        }
        for piece in &mut self.pieces {
            if let Some(id) = piece.resend.take() {
                ctx.sender.cancel(id);
            }
        }
        debug!(
            "split package to {} finished: {:?} ({} pieces)",
            self.dest.peerid(),
            result,
            self.pieces.len()
        );
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}
