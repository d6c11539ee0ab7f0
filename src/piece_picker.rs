//! Picks which piece to download next and tracks the download queue for a
//! single torrent.
//!
//! Originally this only tracked piece availability across connected peers,
//! to prefer the rarest piece first. It has grown into the torrent's full
//! download queue: per-peer request ownership (so a block is never
//! outstanding to two peers at once), and the choke/unchoke capacity
//! accounting a peer session drives when a remote (not) expresses interest.
//! Every operation here is a plain state transition; nothing here performs
//! IO, so callers may hold the lock wrapping this type across these calls
//! without blocking anyone on the network or disk.

use std::collections::{HashMap, HashSet};

use crate::{
    error::{Error, Result},
    Bitfield, PeerHandle, PieceIndex,
};

pub(crate) struct PiecePicker {
    /// Our own piece availability.
    own_pieces: Bitfield,
    /// The number of peers that have each piece, indexed by piece index.
    availability: Vec<usize>,
    /// Pieces we've picked but not yet finished downloading, so the same
    /// piece isn't handed out to two sessions at once.
    picked: HashSet<PieceIndex>,

    /// The last bitfield reported by each connected peer.
    peer_bitfields: HashMap<PeerHandle, Bitfield>,
    /// The peer that owns each outstanding (piece, block offset) request.
    outstanding: HashMap<(PieceIndex, u32), PeerHandle>,
    /// The requests each peer currently has outstanding with us, kept in
    /// lockstep with `outstanding` for O(requests) disconnect cleanup.
    per_peer_requests: HashMap<PeerHandle, Vec<(PieceIndex, u32)>>,
    /// Peers that have told us they're interested in our pieces.
    interested_peers: HashSet<PeerHandle>,
    /// Peers we are currently choking.
    choked_peers: HashSet<PeerHandle>,
    /// Peers we are currently unchoking; bounded by `unchoke_capacity`.
    unchoked_peers: HashSet<PeerHandle>,
    /// The number of unchoke slots extended to interested peers at once.
    unchoke_capacity: usize,
}

impl PiecePicker {
    pub fn new(piece_count: usize, unchoke_capacity: usize) -> Self {
        Self {
            own_pieces: Bitfield::repeat(false, piece_count),
            availability: vec![0; piece_count],
            picked: HashSet::new(),
            peer_bitfields: HashMap::new(),
            outstanding: HashMap::new(),
            per_peer_requests: HashMap::new(),
            interested_peers: HashSet::new(),
            choked_peers: HashSet::new(),
            unchoked_peers: HashSet::new(),
            unchoke_capacity,
        }
    }

    /// Returns our own piece availability.
    pub fn own_bitfield(&self) -> &Bitfield {
        &self.own_pieces
    }

    /// Registers a peer's full piece availability, returning whether we
    /// became interested in them (they have at least one piece we lack).
    ///
    /// Does not track which peer this availability belongs to; callers that
    /// also need disconnect cleanup should use [`Self::update_bitfield`].
    pub fn register_availability(&mut self, bitfield: &Bitfield) -> Result<bool> {
        if bitfield.len() != self.availability.len() {
            return Err(Error::MalformedMessage(
                "bitfield length does not match piece count".into(),
            ));
        }
        let mut interested = false;
        for (index, has_piece) in bitfield.iter().enumerate() {
            if *has_piece {
                self.availability[index] += 1;
                if !self.own_pieces[index] {
                    interested = true;
                }
            }
        }
        Ok(interested)
    }

    /// Registers `peer`'s bitfield, keeping it around so its contribution to
    /// `availability` can be undone on disconnect.
    pub fn update_bitfield(
        &mut self,
        peer: PeerHandle,
        bitfield: Bitfield,
    ) -> Result<bool> {
        let interested = self.register_availability(&bitfield)?;
        self.peer_bitfields.insert(peer, bitfield);
        Ok(interested)
    }

    /// Updates availability and `peer`'s tracked bitfield in response to a
    /// single-piece `have` announcement. Returns whether we're now
    /// interested in `peer` because of it.
    pub fn update_peer_have(&mut self, peer: PeerHandle, index: PieceIndex) -> bool {
        self.availability[index] += 1;
        self.peer_bitfields
            .entry(peer)
            .or_insert_with(|| Bitfield::repeat(false, self.availability.len()))
            .set(index, true);
        !self.own_pieces[index]
    }

    /// Picks the rarest piece we don't have and haven't already handed out,
    /// marking it as picked so it isn't handed out again.
    pub fn pick_piece(&mut self) -> Option<PieceIndex> {
        let index = (0..self.availability.len())
            .filter(|&i| {
                !self.own_pieces[i]
                    && !self.picked.contains(&i)
                    && self.availability[i] > 0
            })
            .min_by_key(|&i| self.availability[i])?;
        self.picked.insert(index);
        Some(index)
    }

    /// Marks a piece as fully downloaded and verified.
    pub fn received_piece(&mut self, index: PieceIndex) {
        self.own_pieces.set(index, true);
        self.picked.remove(&index);
    }

    /// Releases a piece back to the pickable pool without marking it as
    /// owned, for when all of its blocks arrived but it failed hash
    /// verification: some session will have to download it again.
    pub fn release_picked(&mut self, index: PieceIndex) {
        self.picked.remove(&index);
    }

    /// Records that `peer` now owns the outstanding request for the given
    /// block. Returns `false`, refusing to register, if another peer
    /// already owns the same block.
    pub fn add_request(
        &mut self,
        peer: PeerHandle,
        piece_index: PieceIndex,
        offset: u32,
    ) -> bool {
        let key = (piece_index, offset);
        if self.outstanding.contains_key(&key) {
            return false;
        }
        self.outstanding.insert(key, peer);
        self.per_peer_requests.entry(peer).or_default().push(key);
        true
    }

    /// Releases a single outstanding request, symmetric to `add_request`,
    /// but only if `peer` is the one who owns it — a peer's cancel message
    /// (or our own decision to give up on a request) must not be able to
    /// drop another peer's outstanding entry for the same block.
    pub fn cancel(&mut self, peer: PeerHandle, piece_index: PieceIndex, offset: u32) {
        let key = (piece_index, offset);
        if self.outstanding.get(&key) == Some(&peer) {
            self.outstanding.remove(&key);
            if let Some(reqs) = self.per_peer_requests.get_mut(&peer) {
                reqs.retain(|k| *k != key);
            }
        }
    }

    /// Removes the outstanding entry for a block that just arrived, if and
    /// only if `peer` is the one it was requested from.
    pub fn mark_completed(&mut self, peer: PeerHandle, piece_index: PieceIndex, offset: u32) {
        self.cancel(peer, piece_index, offset);
    }

    pub fn add_interested(&mut self, peer: PeerHandle) {
        self.interested_peers.insert(peer);
    }

    pub fn remove_interested(&mut self, peer: PeerHandle) {
        self.interested_peers.remove(&peer);
    }

    pub fn is_interested(&self, peer: PeerHandle) -> bool {
        self.interested_peers.contains(&peer)
    }

    /// Attempts to extend an unchoke slot to `peer`. Returns whether `peer`
    /// is (now, or already was) unchoked.
    pub fn try_unchoke(&mut self, peer: PeerHandle) -> bool {
        if self.unchoked_peers.contains(&peer) {
            return true;
        }
        if self.unchoked_peers.len() >= self.unchoke_capacity {
            return false;
        }
        self.choked_peers.remove(&peer);
        self.unchoked_peers.insert(peer);
        true
    }

    pub fn choke(&mut self, peer: PeerHandle) {
        self.unchoked_peers.remove(&peer);
        self.choked_peers.insert(peer);
    }

    pub fn is_unchoked(&self, peer: PeerHandle) -> bool {
        self.unchoked_peers.contains(&peer)
    }

    /// Releases all bookkeeping tied to a disconnected peer: its outstanding
    /// requests (so another peer may pick them up), its contribution to
    /// piece availability, and its interest/choke membership.
    pub fn on_disconnect(&mut self, peer: PeerHandle) {
        if let Some(reqs) = self.per_peer_requests.remove(&peer) {
            for key in reqs {
                self.outstanding.remove(&key);
            }
        }
        if let Some(bitfield) = self.peer_bitfields.remove(&peer) {
            for (index, has_piece) in bitfield.iter().enumerate() {
                if *has_piece {
                    self.availability[index] =
                        self.availability[index].saturating_sub(1);
                }
            }
        }
        self.interested_peers.remove(&peer);
        self.choked_peers.remove(&peer);
        self.unchoked_peers.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn peer(port: u16) -> PeerHandle {
        PeerHandle(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    #[test]
    fn picks_rarest_piece_first() {
        let mut picker = PiecePicker::new(3, 4);
        let mut a = Bitfield::repeat(false, 3);
        a.set(0, true);
        a.set(1, true);
        picker.register_availability(&a).unwrap();
        let mut b = Bitfield::repeat(false, 3);
        b.set(1, true);
        picker.register_availability(&b).unwrap();
        // piece 1 has availability 2, piece 0 has availability 1
        assert_eq!(picker.pick_piece(), Some(0));
        assert_eq!(picker.pick_piece(), Some(1));
        assert_eq!(picker.pick_piece(), None);
    }

    #[test]
    fn rejects_mismatched_bitfield_length() {
        let mut picker = PiecePicker::new(3, 4);
        let wrong = Bitfield::repeat(false, 4);
        assert!(matches!(
            picker.register_availability(&wrong),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn request_ownership_is_exclusive() {
        let mut picker = PiecePicker::new(2, 4);
        let p1 = peer(1);
        let p2 = peer(2);
        assert!(picker.add_request(p1, 0, 0));
        assert!(!picker.add_request(p2, 0, 0));
        picker.cancel(p1, 0, 0);
        assert!(picker.add_request(p2, 0, 0));
    }

    #[test]
    fn unchoke_capacity_is_enforced() {
        let mut picker = PiecePicker::new(1, 1);
        let p1 = peer(1);
        let p2 = peer(2);
        assert!(picker.try_unchoke(p1));
        assert!(!picker.try_unchoke(p2));
        picker.choke(p1);
        assert!(picker.try_unchoke(p2));
    }

    #[test]
    fn disconnect_releases_requests_and_availability() {
        let mut picker = PiecePicker::new(2, 4);
        let p1 = peer(1);
        let mut bitfield = Bitfield::repeat(false, 2);
        bitfield.set(0, true);
        picker.update_bitfield(p1, bitfield).unwrap();
        picker.add_request(p1, 0, 0);
        picker.add_interested(p1);
        picker.try_unchoke(p1);

        picker.on_disconnect(p1);

        assert!(picker.add_request(peer(2), 0, 0));
        assert!(!picker.is_interested(p1));
        assert!(!picker.is_unchoked(p1));
    }
}
