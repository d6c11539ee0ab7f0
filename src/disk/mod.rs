//! The disk IO subsystem: a single actor task that owns all file handles and
//! in-progress piece write buffers for every torrent in the engine.
//!
//! Every other part of the engine talks to disk only through a [`DiskHandle`],
//! which is just a thin wrapper around a channel. This keeps file IO, piece
//! hashing and the associated locking entirely off of peer session tasks.

mod io;

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{NewTorrentError, Result, WriteError},
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex, TorrentId,
};

pub(crate) use io::Disk;

/// Commands sent to the disk task.
pub(crate) enum Command {
    /// Allocates a new torrent's on-disk storage (opening/creating its
    /// files) and registers it under `id`. Replies once the files have
    /// been opened (or creation failed), since the engine can't seed the
    /// torrent's piece picker or start accepting peers before that.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        reply: oneshot::Sender<std::result::Result<TorrentAllocation, NewTorrentError>>,
    },
    /// Queues a downloaded block for writing. Errors are reported back to
    /// the torrent asynchronously via its alert channel, not through this
    /// call.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a single block back out of a piece already on disk, replying
    /// directly to the caller since a session needs the bytes before it can
    /// make progress serving a peer's request.
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Scans every piece already present in a torrent's files and returns a
    /// bitfield of the ones whose hash checks out, so a restarted download
    /// can resume instead of starting from scratch.
    VerifyOnLoad {
        id: TorrentId,
        reply: oneshot::Sender<Bitfield>,
    },
    /// Shuts down the disk event loop.
    Shutdown,
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Returned to the engine when a torrent's storage was successfully
/// allocated, carrying the channel on which that torrent will receive its
/// own disk alerts (block writes, piece completions).
pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
}

/// Alerts sent to a single torrent about its own disk activity.
pub(crate) enum TorrentAlert {
    /// The result of flushing a completed piece's blocks to disk.
    BatchWrite(std::result::Result<BatchWrite, WriteError>),
}

pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// The result of writing a completed piece's blocks to disk.
pub(crate) struct BatchWrite {
    /// The piece these blocks belong to.
    pub piece_index: PieceIndex,
    /// The blocks that were written, so the torrent can update its own
    /// bookkeeping (e.g. statistics) for each of them. Empty if the piece
    /// failed hash verification, since nothing was written to disk.
    pub blocks: Vec<BlockInfo>,
    /// Whether the piece's hash matched the expected value. `None` if the
    /// piece could not be hashed at all (e.g. due to an IO error part way
    /// through assembling it).
    pub is_piece_valid: Option<bool>,
}

/// A cheaply cloneable handle to the disk task, used by the rest of the
/// engine to queue disk IO without blocking on it.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Spawns the disk event loop on a background task and returns a handle
    /// to it.
    pub fn spawn() -> Result<Self> {
        let (mut disk, cmd_chan) = Disk::new()?;
        tokio::spawn(async move {
            if let Err(e) = disk.start().await {
                log::error!("Disk task exited with error: {}", e);
            }
        });
        Ok(Self { cmd_chan })
    }

    /// Allocates a new torrent's on-disk storage, waiting for its files to
    /// be opened (or creation to fail) before returning.
    pub async fn new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<TorrentAllocation> {
        let (reply, result_port) = oneshot::channel();
        self.cmd_chan.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
            reply,
        })?;
        result_port
            .await
            .map_err(|_| crate::error::Error::Cancelled)?
            .map_err(crate::error::Error::from)
    }

    /// Scans `id`'s files for pieces already present on disk, returning a
    /// bitfield of the ones that verify against their expected hash.
    pub async fn verify_on_load(&self, id: TorrentId) -> Result<Bitfield> {
        let (reply, bitfield_port) = oneshot::channel();
        self.cmd_chan.send(Command::VerifyOnLoad { id, reply })?;
        bitfield_port
            .await
            .map_err(|_| crate::error::Error::Cancelled)
    }

    /// Queues a downloaded block for writing to `id`'s files.
    pub fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::WriteBlock { id, info, data })?;
        Ok(())
    }

    /// Reads a single block out of a piece already on disk, for seeding.
    pub async fn read_block(&self, id: TorrentId, info: BlockInfo) -> Result<Vec<u8>> {
        let (reply, read_port) = oneshot::channel();
        self.cmd_chan.send(Command::ReadBlock { id, info, reply })?;
        read_port.await.map_err(|_| crate::error::Error::Cancelled)?
    }

    /// Tells the disk task to shut down.
    pub fn shutdown(&self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown)?;
        Ok(())
    }
}

