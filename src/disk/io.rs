use {
    nix::sys::uio::pwritev,
    sha1::{Digest, Sha1},
    std::{
        collections::{BTreeMap, HashMap},
        fs::{self, File, OpenOptions},
        io::IoSlice,
        ops::Range,
        os::unix::fs::FileExt,
        sync::{Arc, Mutex},
    },
    tokio::{
        sync::{mpsc, RwLock},
        task,
    },
};

use {
    super::{
        BatchWrite, Command, CommandReceiver, CommandSender, TorrentAlert,
        TorrentAlertReceiver, TorrentAlertSender, TorrentAllocation,
    },
    crate::{
        block_count,
        error::{Error, NewTorrentError, Result, WriteError},
        iovecs::IoVecs,
        storage_info::{FsStructure, StorageInfo},
        Bitfield, BlockInfo, FileIndex, FileInfo, PieceIndex, Sha1Hash, TorrentId,
    },
};

/// The entity responsible for saving downloaded file blocks to disk and
/// verifying whether downloaded pieces are valid.
pub(crate) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap, which
    /// includes various metadata about torrent and the torrent specific alert
    /// channel.
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender.
    pub(crate) fn new() -> Result<(Self, CommandSender)> {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
            },
            cmd_chan,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(crate) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            log::debug!("Disk received command");
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                    reply,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        let _ = reply.send(Err(NewTorrentError::AlreadyExists));
                        continue;
                    }

                    // NOTE: Do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: we just
                    // want to log it and notify engine of it.
                    let torrent_res = Torrent::new(info, piece_hashes);
                    match torrent_res {
                        Ok((torrent, alert_port)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, RwLock::new(torrent));
                            let _ = reply.send(Ok(TorrentAllocation { id, alert_port }));
                        }
                        Err(e) => {
                            log::warn!("Torrent {} allocation failure: {}", id, e);
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::ReadBlock { id, info, reply } => {
                    let result = self.read_block(id, info).await;
                    // the caller may have given up waiting; that's not our
                    // problem
                    let _ = reply.send(result);
                }
                Command::VerifyOnLoad { id, reply } => {
                    let bitfield = match self.torrents.get(&id) {
                        Some(torrent) => torrent.read().await.verify_on_load().await,
                        None => {
                            log::warn!("Torrent {} not found for verify-on-load", id);
                            Bitfield::new()
                        }
                    };
                    let _ = reply.send(bitfield);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Queues a block for writing and fails if the torrent id is invalid.
    ///
    /// If the block could not be written due to IO failure, the torrent is
    /// notified of it.
    async fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving torrent {} block {:?} to disk", id, info);
        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.write().await.write_block(info, data).await
    }

    /// Reads a single block back out of a piece for seeding.
    async fn read_block(&self, id: TorrentId, info: BlockInfo) -> Result<Vec<u8>> {
        log::trace!("Reading torrent {} block {:?} from disk", id, info);
        let torrent = self
            .torrents
            .get(&id)
            .ok_or(Error::InvalidTorrentId)?;
        torrent.read().await.read_block(info).await
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// torrent's download and piece sizes, etc.
struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to alert a torrent that a block has been written to
    /// disk and/or a piece was completed.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the torrent's
    /// disk write buffer. Each piece is mapped to its index for faster lookups.
    // TODO(https://github.com/mandreyel/cratetorrent/issues/22): Currently
    // there is no upper bound on the in-memory write buffer, so this may lead
    // to OOM.
    pieces: HashMap<PieceIndex, Piece>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Disk IO statistics.
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// Unlike a fresh download, the download directory is allowed to already
    /// exist: a caller resuming a previous session relies on this to pick up
    /// where it left off. Existing file content is left untouched here;
    /// verifying it against the expected piece hashes is `verify_on_load`'s
    /// job, run separately so that a corrupt file never prevents the
    /// torrent from starting.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<(Self, TorrentAlertReceiver), NewTorrentError> {
        let open_file = |info: FileInfo| {
            if let Some(parent) = info.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    log::info!("Creating torrent subdir {:?}", parent);
                    fs::create_dir_all(parent).map_err(NewTorrentError::Io)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", &info.path);
                    NewTorrentError::Io(e)
                })?;
            Ok(Mutex::new(TorrentFile { info, handle }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                let file = FileInfo {
                    path: info.download_dir.clone(),
                    torrent_offset: file.torrent_offset,
                    len: file.len,
                };
                vec![open_file(file)?]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is multi file: {:?}", files);
                log::debug!("Setting up directory structure");
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                    };
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                info,
                alert_chan,
                pieces: HashMap::new(),
                files: Arc::new(files),
                piece_hashes,
                stats: Stats::default(),
            },
            alert_port,
        ))
    }

    async fn write_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        log::trace!("Saving block {:?} to disk", info);

        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(info) {
                self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                return Ok(());
            }
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("newly inserted piece not present");

        piece.enqueue_block(info.offset, data);

        if piece.is_complete() {
            let piece = self.pieces.remove(&piece_index).unwrap();
            let piece_len = self.info.piece_len;
            let files = Arc::clone(&self.files);

            let write_result = task::spawn_blocking(move || {
                let is_piece_valid = piece.matches_hash();

                let (write_count, blocks) = if is_piece_valid {
                    log::info!("Piece {} is valid", piece_index);
                    let piece_torrent_offset = piece_index as u64 * piece_len as u64;
                    let write_count = piece.write(piece_torrent_offset, &files)?;
                    let blocks = piece
                        .blocks
                        .iter()
                        .map(|(offset, block)| BlockInfo {
                            piece_index: info.piece_index,
                            offset: *offset,
                            len: block.len() as u32,
                        })
                        .collect();
                    (Some(write_count), blocks)
                } else {
                    log::warn!("Piece {} is NOT valid", info.piece_index);
                    (None, Vec::new())
                };

                Ok::<_, WriteError>((is_piece_valid, write_count, blocks))
            })
            .await
            .expect("disk IO write task panicked");

            match write_result {
                Ok((is_piece_valid, write_count, blocks)) => {
                    if is_piece_valid {
                        if let Some(write_count) = write_count {
                            self.stats.write_count += write_count as u64;
                        }
                    }
                    self.alert_chan.send(TorrentAlert::BatchWrite(Ok(
                        BatchWrite {
                            piece_index,
                            blocks,
                            is_piece_valid: Some(is_piece_valid),
                        },
                    )))?;
                }
                Err(e) => {
                    log::warn!("Disk write error: {}", e);
                    self.stats.write_failure_count += 1;
                    self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                }
            }
        }

        Ok(())
    }

    /// Starts a new in-progress piece, creating metadata for it in self.
    fn start_new_piece(&mut self, info: BlockInfo) -> Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", info.piece_index);

        let hash_pos = info.piece_index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            log::warn!("Piece index {} is invalid", info.piece_index);
            return Err(WriteError::InvalidPieceIndex);
        }

        let hash_slice = &self.piece_hashes[hash_pos..hash_pos + 20];
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(hash_slice);
        log::debug!(
            "Piece {} expected hash {}",
            info.piece_index,
            hex::encode(&expected_hash)
        );

        let len = self
            .info
            .piece_len(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} is {} bytes long", info.piece_index, len);

        let files = self
            .info
            .files_intersecting_piece(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} intersects files: {:?}", info.piece_index, files);

        let piece = Piece {
            expected_hash,
            len,
            blocks: BTreeMap::new(),
            files,
        };
        self.pieces.insert(info.piece_index, piece);

        Ok(())
    }

    /// Reads a single block's bytes off of disk, for serving a peer's
    /// request.
    async fn read_block(&self, info: BlockInfo) -> Result<Vec<u8>> {
        if info.piece_index >= self.info.piece_count {
            return Err(Error::InvalidPieceIndex);
        }
        let torrent_offset =
            info.piece_index as u64 * self.info.piece_len as u64 + info.offset as u64;
        let len = info.len as usize;
        let files = Arc::clone(&self.files);
        task::spawn_blocking(move || read_range(&files, torrent_offset, len))
            .await
            .expect("disk IO read task panicked")
            .map_err(Error::from)
    }

    /// Scans every piece whose files exist and are long enough, hashing it
    /// against the expected value. A piece whose files are missing, too
    /// short, or simply wrong is reported as missing rather than aborting
    /// the scan: a partially-downloaded or partially-corrupt torrent must
    /// still resume for the pieces that are intact.
    pub async fn verify_on_load(&self) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, self.info.piece_count);
        for index in 0..self.info.piece_count {
            let Ok(len) = self.info.piece_len(index) else {
                continue;
            };
            let hash_pos = index * 20;
            if hash_pos + 20 > self.piece_hashes.len() {
                continue;
            }
            let mut expected_hash = [0u8; 20];
            expected_hash.copy_from_slice(&self.piece_hashes[hash_pos..hash_pos + 20]);

            let torrent_offset = index as u64 * self.info.piece_len as u64;
            // a short read (missing file, truncated file) just leaves the
            // piece unset; it must never abort the whole scan
            match self.read_range_sync(torrent_offset, len as usize) {
                Ok(bytes) => {
                    let digest = Sha1::digest(&bytes);
                    if digest.as_slice() == expected_hash {
                        bitfield.set(index, true);
                    }
                }
                Err(e) => {
                    log::debug!("Piece {} not available on load: {}", index, e);
                }
            }
        }
        bitfield
    }

    fn read_range_sync(&self, torrent_offset: u64, len: usize) -> Result<Vec<u8>, WriteError> {
        read_range(&self.files, torrent_offset, len)
    }
}

/// Reads `len` bytes starting at `torrent_offset`, across as many of
/// `files` as the range spans.
fn read_range(
    files: &[Mutex<TorrentFile>],
    torrent_offset: u64,
    len: usize,
) -> Result<Vec<u8>, WriteError> {
    let mut out = Vec::with_capacity(len);
    let mut offset = torrent_offset;
    let mut remaining = len;
    for file in files {
        if remaining == 0 {
            break;
        }
        let file = file.lock().unwrap();
        if offset < file.info.torrent_offset || offset >= file.info.torrent_end_offset() {
            continue;
        }
        let slice = file.info.get_slice(offset, remaining as u64);
        let mut buf = vec![0u8; slice.len as usize];
        file.handle.read_exact_at(&mut buf, slice.offset).map_err(WriteError::Io)?;
        offset += slice.len;
        remaining -= slice.len as usize;
        out.extend_from_slice(&buf);
    }
    Ok(out)
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    fn write_vectored_at(
        &self,
        iovecs: &mut IoVecs<'_>,
        offset: u64,
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;
        while !iovecs.is_empty() {
            let bufs = iovecs.buffers();
            let write_count = pwritev(&self.handle, &bufs, offset as i64).map_err(|e| {
                log::warn!("File {:?} write error: {}", self.info.path, e);
                WriteError::Io(std::io::Error::last_os_error())
            })?;
            iovecs.advance(write_count);
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    expected_hash: Sha1Hash,
    len: u32,
    blocks: BTreeMap<u32, Vec<u8>>,
    files: Range<FileIndex>,
}

impl Piece {
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Calculates the piece's hash using all its blocks and returns if it
    /// matches the expected hash.
    fn matches_hash(&self) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(block);
        }
        let hash = hasher.finalize();
        log::debug!("Piece hash: {:x}", hash);
        hash.as_slice() == self.expected_hash
    }

    /// Writes the piece's blocks to the files the piece overlaps with.
    fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[Mutex<TorrentFile>],
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;

        let blocks: Vec<&[u8]> = self.blocks.values().map(|b| b.as_slice()).collect();
        let mut bufs = blocks;
        let mut write_torrent_offset = piece_torrent_offset;

        let files = &files[self.files.clone()];
        debug_assert!(!files.is_empty());
        if files.len() == 1 {
            let file = files.first().unwrap().lock().unwrap();
            let slice = file.info.get_slice(write_torrent_offset, self.len as u64);
            let mut iovecs = IoVecs::unbounded(bufs);
            debug_assert!(
                iovecs
                    .buffers()
                    .iter()
                    .map(|iov: &IoSlice| iov.len() as u64)
                    .sum::<u64>()
                    <= slice.len
            );
            total_write_count += file.write_vectored_at(&mut iovecs, slice.offset)?;
            bufs = iovecs.into_tail();
        } else {
            for file in files.iter() {
                let file = file.lock().unwrap();
                let slice = file.info.get_slice(write_torrent_offset, self.len as u64);
                debug_assert!(slice.len > 0);
                debug_assert!(!bufs.is_empty());
                debug_assert!(!bufs[0].is_empty());

                let mut iovecs = IoVecs::bounded(bufs, slice.len as usize);
                debug_assert!(
                    iovecs
                        .buffers()
                        .iter()
                        .map(|iov: &IoSlice| iov.len() as u64)
                        .sum::<u64>()
                        <= slice.len
                );

                let write_count = file.write_vectored_at(&mut iovecs, slice.offset)?;
                bufs = iovecs.into_tail();

                write_torrent_offset += write_count as u64;
                total_write_count += write_count;
            }
        }

        debug_assert!(bufs.is_empty());

        Ok(total_write_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_single_file_torrent(dir: &std::path::Path, data: &[u8], piece_len: u32) -> (StorageInfo, Vec<u8>) {
        let path = dir.join("file.bin");
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("file.bin"),
            torrent_offset: 0,
            len: data.len() as u64,
        });
        let piece_count = block_count_for(data.len() as u64, piece_len as u64);
        let last_piece_len =
            data.len() as u64 - piece_len as u64 * (piece_count - 1) as u64;
        let info = StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: last_piece_len as u32,
            download_len: data.len() as u64,
            download_dir: path,
            structure,
        };
        let mut hashes = Vec::new();
        for chunk in data.chunks(piece_len as usize) {
            let hash: Sha1Hash = Sha1::digest(chunk).into();
            hashes.extend_from_slice(&hash);
        }
        (info, hashes)
    }

    fn block_count_for(len: u64, piece_len: u64) -> usize {
        ((len + piece_len - 1) / piece_len) as usize
    }

    #[tokio::test]
    async fn writes_and_completes_single_piece() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; 16 * 1024];
        let (info, hashes) = make_single_file_torrent(dir.path(), &data, 16 * 1024);
        let (mut torrent, mut alert_port) = Torrent::new(info, hashes).unwrap();

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: data.len() as u32,
        };
        torrent.write_block(block, data.clone()).await.unwrap();

        let alert = alert_port.recv().await.unwrap();
        match alert {
            TorrentAlert::BatchWrite(Ok(batch)) => {
                assert_eq!(batch.is_piece_valid, Some(true));
            }
            _ => panic!("expected a successful batch write"),
        }
    }

    #[tokio::test]
    async fn verify_on_load_detects_existing_valid_piece() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![9u8; 16 * 1024];
        let (info, hashes) = make_single_file_torrent(dir.path(), &data, 16 * 1024);
        fs::write(&info.download_dir, &data).unwrap();

        let (torrent, _alert_port) = Torrent::new(info, hashes).unwrap();
        let bitfield = torrent.verify_on_load().await;
        assert!(bitfield[0]);
    }

    #[tokio::test]
    async fn verify_on_load_skips_missing_file_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![3u8; 16 * 1024];
        let (info, hashes) = make_single_file_torrent(dir.path(), &data, 16 * 1024);
        // note: never written to disk

        let (torrent, _alert_port) = Torrent::new(info, hashes).unwrap();
        let bitfield = torrent.verify_on_load().await;
        assert!(!bitfield[0]);
    }
}
