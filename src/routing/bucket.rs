use crate::peer::Peer;

#[derive(Debug, Default)]
pub(super) struct SubBucket {
    peers: Vec<Peer>,
}

impl SubBucket {
    pub(super) fn from_peers(peers: Vec<Peer>) -> Self {
        Self { peers }
    }

    pub(super) fn len(&self) -> usize {
        self.peers.len()
    }

    pub(super) fn push(&mut self, peer: Peer) {
        self.peers.push(peer);
    }

    pub(super) fn get(&self, peerid: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.peerid() == peerid)
    }

    pub(super) fn get_mut(&mut self, peerid: &str) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.peerid() == peerid)
    }

    pub(super) fn remove(&mut self, peerid: &str) -> Option<Peer> {
        let pos = self.peers.iter().position(|p| p.peerid() == peerid)?;
        Some(self.peers.remove(pos))
    }

    pub(super) fn remove_at(&mut self, pos: usize) -> Peer {
        self.peers.remove(pos)
    }

    pub(super) fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Removes every peer matching `pred`, preserving the order of the rest.
    pub(super) fn drain_where(&mut self, mut pred: impl FnMut(&Peer) -> bool) -> Vec<Peer> {
        let mut drained = Vec::new();
        let mut kept = Vec::with_capacity(self.peers.len());
        for peer in self.peers.drain(..) {
            if pred(&peer) {
                drained.push(peer);
            } else {
                kept.push(peer);
            }
        }
        self.peers = kept;
        drained
    }

    /// Position of the matching peer heard from least recently. Peers never
    /// heard from sort first; ties go to the earliest inserted.
    pub(super) fn least_active(&self, pred: impl Fn(&Peer) -> bool) -> Option<usize> {
        self.peers
            .iter()
            .enumerate()
            .filter(|(_, p)| pred(p))
            .min_by_key(|(i, p)| (p.last_recv_time(), p.last_active_time(), *i))
            .map(|(i, _)| i)
    }
}
