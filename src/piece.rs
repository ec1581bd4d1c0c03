//! Splitting of oversized packages and their reassembly.
//!
//! A package that does not fit the MTU travels as a series of
//! `PACKAGE_PIECE_REQ` carriers, each holding a slice of the encoded package.
//! The receiver buffers slices per sender and task until all `max + 1` have
//! arrived, then feeds the concatenation back into the normal decode path.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::constants::MAX_PIECE_COUNT;

/// Cuts `data` into slices of at most `piece_size` bytes.
pub fn split_payload(data: &Bytes, piece_size: usize) -> Vec<Bytes> {
    let piece_size = piece_size.max(1);
    (0..data.len())
        .step_by(piece_size)
        .map(|start| data.slice(start..(start + piece_size).min(data.len())))
        .collect()
}

#[derive(Debug)]
struct PieceBuffer {
    pieces: Vec<Option<Bytes>>,
    received: usize,
    done: bool,
    update_time: u64,
}

impl PieceBuffer {
    fn new(count: usize, now: u64) -> Self {
        Self {
            pieces: vec![None; count],
            received: 0,
            done: false,
            update_time: now,
        }
    }

    fn assemble(&mut self) -> Bytes {
        let len = self.pieces.iter().flatten().map(|p| p.len()).sum();
        let mut out = BytesMut::with_capacity(len);
        for piece in self.pieces.drain(..).flatten() {
            out.extend_from_slice(&piece);
        }
        out.freeze()
    }
}

/// Reassembly buffers keyed by sender and task.
pub struct PieceRebuilder {
    senders: HashMap<String, HashMap<u32, PieceBuffer>>,
    timeout: u64,
}

impl PieceRebuilder {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            senders: HashMap::new(),
            timeout: timeout_ms,
        }
    }

    /// Number of live reassembly buffers.
    pub fn len(&self) -> usize {
        self.senders.values().map(|tasks| tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Stores one piece. Returns the whole payload when this piece completes
    /// it; later duplicates of a completed task return `None`.
    pub fn add_piece(
        &mut self,
        peerid: &str,
        task_id: u32,
        max: u32,
        no: u32,
        payload: Bytes,
        now: u64,
    ) -> Option<Bytes> {
        if max >= MAX_PIECE_COUNT || no > max {
            debug!(
                "dropping piece {}/{} of task {} from {}",
                no, max, task_id, peerid
            );
            return None;
        }

        let count = max as usize + 1;
        let buffer = self
            .senders
            .entry(peerid.to_string())
            .or_default()
            .entry(task_id)
            .or_insert_with(|| PieceBuffer::new(count, now));

        if buffer.done {
            return None;
        }
        if buffer.pieces.len() != count {
            debug!(
                "piece count mismatch for task {} from {}: {} != {}",
                task_id,
                peerid,
                buffer.pieces.len(),
                count
            );
            return None;
        }

        buffer.update_time = now;
        let slot = &mut buffer.pieces[no as usize];
        if slot.is_none() {
            *slot = Some(payload);
            buffer.received += 1;
        }

        if buffer.received < count {
            return None;
        }
        buffer.done = true;
        Some(buffer.assemble())
    }

    /// Drops buffers idle for longer than the timeout, completed ones
    /// included, and prunes senders left without buffers.
    pub fn knock_out(&mut self, now: u64) -> usize {
        let timeout = self.timeout;
        let mut removed = 0;
        self.senders.retain(|_, tasks| {
            let before = tasks.len();
            tasks.retain(|_, b| now.saturating_sub(b.update_time) <= timeout);
            removed += before - tasks.len();
            !tasks.is_empty()
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 7 % 251) as u8).collect::<Vec<_>>())
    }

    #[test]
    fn test_split_sizes() {
        let pieces = split_payload(&payload(2500), 1000);
        assert_eq!(pieces.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![1000, 1000, 500]);
        assert!(split_payload(&Bytes::new(), 10).is_empty());
    }

    #[test]
    fn test_rebuild_any_order_exactly_once() {
        let data = payload(5000);
        let pieces = split_payload(&data, 1200);
        let max = pieces.len() as u32 - 1;
        let mut rebuilder = PieceRebuilder::new(1000);

        let order = [3usize, 0, 4, 1, 2];
        let mut rebuilt = Vec::new();
        for &no in &order {
            if let Some(out) =
                rebuilder.add_piece("alice", 7, max, no as u32, pieces[no].clone(), 10)
            {
                rebuilt.push(out);
            }
        }
        assert_eq!(rebuilt, vec![data]);

        for (no, piece) in pieces.iter().enumerate() {
            assert!(rebuilder
                .add_piece("alice", 7, max, no as u32, piece.clone(), 20)
                .is_none());
        }
    }

    #[test]
    fn test_duplicate_piece_counted_once() {
        let mut rebuilder = PieceRebuilder::new(1000);
        assert!(rebuilder
            .add_piece("a", 1, 1, 0, Bytes::from_static(b"ab"), 1)
            .is_none());
        assert!(rebuilder
            .add_piece("a", 1, 1, 0, Bytes::from_static(b"ab"), 2)
            .is_none());
        assert_eq!(
            rebuilder.add_piece("a", 1, 1, 1, Bytes::from_static(b"cd"), 3),
            Some(Bytes::from_static(b"abcd"))
        );
    }

    #[test]
    fn test_rejects_bad_indices() {
        let mut rebuilder = PieceRebuilder::new(1000);
        assert!(rebuilder.add_piece("a", 1, 1, 2, Bytes::new(), 1).is_none());
        assert!(rebuilder
            .add_piece("a", 1, MAX_PIECE_COUNT, 0, Bytes::new(), 1)
            .is_none());
        assert!(rebuilder.is_empty());

        rebuilder.add_piece("a", 2, 2, 0, Bytes::new(), 1);
        assert!(rebuilder.add_piece("a", 2, 4, 3, Bytes::new(), 1).is_none());
    }

    #[test]
    fn test_knock_out_prunes_senders() {
        let mut rebuilder = PieceRebuilder::new(100);
        rebuilder.add_piece("a", 1, 1, 0, Bytes::new(), 10);
        rebuilder.add_piece("b", 1, 1, 0, Bytes::new(), 150);
        assert_eq!(rebuilder.len(), 2);

        assert_eq!(rebuilder.knock_out(200), 1);
        assert_eq!(rebuilder.len(), 1);
        assert_eq!(rebuilder.knock_out(1000), 1);
        assert!(rebuilder.is_empty());
    }
}
