//! Per-torrent shared state and the handle the engine hands out to callers.
//!
//! Unlike a peer session or the disk actor, a torrent is not itself a
//! background task: its state is a bundle the engine's listener, dialer and
//! announce-loop tasks all read and mutate directly through shared handles.
//! This avoids a wasteful extra hop through a torrent-level command channel
//! for what is, in this engine, just shared state plus a couple of
//! `Arc`-wrapped collaborators.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::{broadcast, RwLock};

use crate::{
    conf::TorrentConf, disk::DiskHandle, metainfo::Metainfo, peer, piece_picker::PiecePicker,
    storage_info::StorageInfo, Bitfield, PeerHandle, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// The capacity of the per-torrent `have` broadcast channel. Lagging
/// receivers (a session that's busy for a while) simply miss old `have`s;
/// this is harmless since a full bitfield exchange already happened at
/// connection time and a missed `have` just means a slightly stale view of
/// a peer we'll likely hear about again.
const HAVE_CHANNEL_CAPACITY: usize = 1024;

/// Information about a torrent that is the same no matter which peer
/// session observes it; shared behind an `Arc` by every session of a
/// torrent.
pub(crate) struct SharedStatus {
    /// This torrent's 20 byte info hash, used in the handshake.
    pub info_hash: Sha1Hash,
    /// Our own client id, sent in every handshake.
    pub client_id: PeerId,
    /// This torrent's engine-local id.
    pub id: TorrentId,
    /// Piece and file layout of the torrent.
    pub storage: StorageInfo,
    /// Fires the index of a piece every time any session in this torrent
    /// finishes and verifies it, so that every other session can gossip
    /// `have` to its own peer.
    pub have_tx: broadcast::Sender<PieceIndex>,
}

/// Everything the engine needs to run a single torrent: its shared status,
/// its download queue, and the sessions currently connected to it.
pub(crate) struct Torrent {
    pub status: Arc<SharedStatus>,
    pub piece_picker: Arc<RwLock<PiecePicker>>,
    pub disk: DiskHandle,
    pub conf: TorrentConf,
    /// Command senders for every currently connected peer session, keyed by
    /// remote address, so the engine can shut them down or skip dialing an
    /// already-connected peer.
    pub sessions: Mutex<HashMap<PeerHandle, peer::Sender>>,
}

impl Torrent {
    pub fn new(
        id: TorrentId,
        metainfo: &Metainfo,
        client_id: PeerId,
        conf: TorrentConf,
        disk: DiskHandle,
    ) -> Self {
        let storage = StorageInfo::new(metainfo, conf.download_dir.clone());
        let piece_count = storage.piece_count;
        let (have_tx, _) = broadcast::channel(HAVE_CHANNEL_CAPACITY);
        let status = Arc::new(SharedStatus {
            info_hash: metainfo.info_hash,
            client_id,
            id,
            storage,
            have_tx,
        });
        Self {
            status,
            piece_picker: Arc::new(RwLock::new(PiecePicker::new(
                piece_count,
                conf.unchoke_capacity,
            ))),
            disk,
            conf,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds the piece picker's own availability with a bitfield recovered
    /// from an on-disk verification scan (see `disk::io::Torrent::verify_on_load`).
    pub async fn seed_own_bitfield(&self, bitfield: Bitfield) {
        let mut picker = self.piece_picker.write().await;
        for (index, has_piece) in bitfield.iter().enumerate() {
            if *has_piece {
                picker.received_piece(index);
            }
        }
    }

    /// Returns a snapshot of our own piece availability.
    pub async fn bitfield(&self) -> Bitfield {
        self.piece_picker.read().await.own_bitfield().clone()
    }

    /// Returns true once every piece has been downloaded and verified.
    pub async fn is_seed(&self) -> bool {
        self.bitfield().await.count_ones() == self.status.storage.piece_count
    }

    /// Records a newly spawned session's command sender, so the engine can
    /// address it later (for shutdown) and the dialer can skip it next time.
    pub fn register_session(&self, handle: PeerHandle, chan: peer::Sender) {
        self.sessions.lock().unwrap().insert(handle, chan);
    }

    /// Drops a session's entry once it has finished running.
    pub fn deregister_session(&self, handle: PeerHandle) {
        self.sessions.lock().unwrap().remove(&handle);
    }

    /// Returns whether we are already connected to (or connecting to) the
    /// given remote.
    pub fn is_connected(&self, handle: PeerHandle) -> bool {
        self.sessions.lock().unwrap().contains_key(&handle)
    }

    /// Broadcasts the shutdown command to every currently connected
    /// session.
    pub fn shutdown_sessions(&self) {
        for chan in self.sessions.lock().unwrap().values() {
            let _ = chan.send(peer::Command::Shutdown);
        }
    }
}

/// A cheaply cloneable, externally visible handle to a running torrent.
#[derive(Clone)]
pub struct TorrentHandle {
    pub(crate) torrent: Arc<Torrent>,
}

impl TorrentHandle {
    pub(crate) fn new(torrent: Arc<Torrent>) -> Self {
        Self { torrent }
    }

    /// This torrent's engine-local id.
    pub fn id(&self) -> TorrentId {
        self.torrent.status.id
    }

    /// Returns a snapshot of our own piece availability.
    pub async fn bitfield(&self) -> Bitfield {
        self.torrent.bitfield().await
    }

    /// Returns true once every piece has been downloaded and verified.
    pub async fn is_seed(&self) -> bool {
        self.torrent.is_seed().await
    }
}
