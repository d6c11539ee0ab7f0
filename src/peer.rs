mod codec;

use std::{sync::Arc, time::Duration};

use futures::{
    select,
    stream::{Fuse, SplitSink},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{
        broadcast,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    time::interval,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    disk::DiskHandle, download::PieceDownload, error::*, piece_picker::PiecePicker,
    torrent::SharedStatus, Bitfield, BlockInfo, PeerHandle, PeerId, PieceIndex,
};
use codec::*;

// re-exported so the engine's listener can read and validate a connection's
// handshake itself, before it knows which torrent (and thus which
// `PeerSession`) the connection belongs to
pub(crate) use codec::{Handshake, HandshakeCodec};

/// The number of times we re-send `interested` while choked before giving
/// up and marking ourselves not interested in a peer.
const MAX_UNCHOKE_ATTEMPTS: u32 = 5;
/// How often we check whether an unchoke we're waiting for is overdue.
const UNCHOKE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<SharedStatus>,
    /// The piece picker and download queue, shared by every session in this
    /// torrent.
    piece_picker: Arc<RwLock<PiecePicker>>,
    /// The entity used to save downloaded file blocks to disk and to read
    /// pieces back out for seeding.
    disk: DiskHandle,
    /// The port on which the session receives commands from the torrent.
    cmd_port: Fuse<Receiver>,
    /// Fires whenever any session in the torrent completes a piece, so this
    /// one can gossip `have` to its peer.
    have_rx: broadcast::Receiver<PieceIndex>,
    /// This session's opaque id in the download queue: the remote address.
    handle: PeerHandle,
    /// Whether this session was the dialer (outbound) or the acceptor
    /// (inbound). Only used for logging.
    is_outbound: bool,
    /// Session related information.
    status: Status,
    /// The active piece downloads this session is participating in.
    downloads: Vec<PieceDownload>,
    /// Requests we've sent to peer and are still awaiting a block for.
    ///
    /// If we receive a block that is not in this list, it is dropped. If we
    /// receive a block whose request entry is in here, the entry is
    /// removed.
    ///
    /// Note that if a request for a piece's block is in this queue, there
    /// _must_ be a corresponding entry for the piece download in
    /// `downloads`.
    outgoing_requests: Vec<BlockInfo>,
    /// Information about a peer that is set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// The number of consecutive times we've re-sent `interested` without
    /// receiving an unchoke in response.
    unchoke_attempts: u32,
}

impl PeerSession {
    /// Creates a new outbound session that will dial the peer at `addr`.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        addr: std::net::SocketAddr,
    ) -> (Self, Sender) {
        Self::new(torrent, piece_picker, disk, addr, true)
    }

    /// Creates a new inbound session for a connection that has already been
    /// accepted (and whose handshake has already been read by the listener
    /// to determine which torrent it belongs to).
    pub fn inbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        addr: std::net::SocketAddr,
    ) -> (Self, Sender) {
        Self::new(torrent, piece_picker, disk, addr, false)
    }

    fn new(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        addr: std::net::SocketAddr,
        is_outbound: bool,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let have_rx = torrent.have_tx.subscribe();
        (
            Self {
                torrent,
                piece_picker,
                disk,
                cmd_port: cmd_port.fuse(),
                have_rx,
                handle: PeerHandle::from(addr),
                is_outbound,
                status: Status::default(),
                downloads: Vec::new(),
                outgoing_requests: Vec::new(),
                peer_info: None,
                unchoke_attempts: 0,
            },
            cmd_chan,
        )
    }

    /// Dials the peer, performs the handshake as the initiating side, and
    /// runs the session until it closes or errors.
    pub async fn start_outbound(&mut self) -> Result<()> {
        log::info!("Starting outbound peer {} session", self.handle);
        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.handle.0).await?;
        log::info!("Connected to peer {}", self.handle);

        let mut socket = Framed::new(socket, HandshakeCodec);
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        log::info!("Waiting for peer {} handshake", self.handle);
        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => return Ok(()),
        };
        self.accept_handshake(peer_handshake)?;

        let socket = switch_codec(socket, self.torrent.storage.piece_count);
        self.run(socket).await
    }

    /// Completes the handshake as the accepting side: `socket` already had
    /// the peer's handshake read off of it by the listener (to determine
    /// which torrent the connection is for); we validate it and reply.
    pub async fn start_inbound(
        &mut self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
    ) -> Result<()> {
        log::info!("Accepting inbound peer {} session", self.handle);
        self.status.state = State::Handshaking;
        self.accept_handshake(peer_handshake)?;

        let our_handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        socket.send(our_handshake).await?;

        let socket = switch_codec(socket, self.torrent.storage.piece_count);
        self.run(socket).await
    }

    /// Validates a received handshake against our own torrent and records
    /// the peer's id.
    fn accept_handshake(&mut self, handshake: Handshake) -> Result<()> {
        if handshake.prot != PROTOCOL_STRING.as_bytes() {
            return Err(HandshakeError::InvalidProtocol.into());
        }
        if handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake has mismatching info hash", self.handle);
            return Err(HandshakeError::InfoHashMismatch.into());
        }
        self.peer_info = Some(PeerInfo {
            peer_id: handshake.peer_id,
            pieces: None,
            supports_do_not_have: handshake.reserved[7] & DO_NOT_HAVE_BIT != 0,
        });
        Ok(())
    }

    /// Runs the session after the handshake completes: announces our own
    /// availability and enters the main select loop.
    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        self.status.state = State::Connected;
        log::info!("Peer {} session state: {:?}", self.handle, self.status.state);

        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // announce our own availability; harmless (if wasteful) to send an
        // all-zero bitfield when we have nothing yet
        let own_bitfield = self.piece_picker.read().await.own_bitfield().clone();
        sink.send(Message::Bitfield(own_bitfield)).await?;

        let mut unchoke_retry = interval(UNCHOKE_RETRY_INTERVAL);

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    log::debug!("Received message {:?} from peer {}", msg.id(), self.handle);
                    self.handle_msg(&mut sink, msg).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.handle);
                            break;
                        }
                    }
                }
                have = self.have_rx.recv() => {
                    if let Ok(index) = have {
                        self.gossip_have(&mut sink, index).await?;
                    }
                }
                _ = unchoke_retry.tick() => {
                    self.retry_unchoke(&mut sink).await?;
                }
            }
        }

        if self.status.is_peer_interested {
            self.piece_picker.write().await.on_disconnect(self.handle);
        }
        self.status.state = State::Closed;

        Ok(())
    }

    /// Sends `have` to the peer unless it's already known to have the piece.
    async fn gossip_have(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        index: PieceIndex,
    ) -> Result<()> {
        let already_has = self
            .peer_info
            .as_ref()
            .and_then(|info| info.pieces.as_ref())
            .map(|pieces| pieces[index])
            .unwrap_or(false);
        if !already_has {
            sink.send(Message::Have { index }).await?;
        }
        Ok(())
    }

    /// If we're interested but have been sitting choked for too long,
    /// re-signal interest a bounded number of times before giving up.
    async fn retry_unchoke(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if !self.status.is_interested || !self.status.is_choked {
            self.unchoke_attempts = 0;
            return Ok(());
        }
        self.unchoke_attempts += 1;
        if self.unchoke_attempts > MAX_UNCHOKE_ATTEMPTS {
            log::warn!(
                "Peer {} never unchoked us after {} attempts, giving up",
                self.handle,
                MAX_UNCHOKE_ATTEMPTS
            );
            self.status.is_interested = false;
            self.unchoke_attempts = 0;
            sink.send(Message::NotInterested).await?;
        } else {
            log::debug!(
                "Re-sending interested to peer {} (attempt {})",
                self.handle,
                self.unchoke_attempts
            );
            sink.send(Message::Interested).await?;
        }
        Ok(())
    }

    /// Handles a single message from the peer.
    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                log::trace!("Peer {} sent keep alive", self.handle);
            }
            Message::Bitfield(mut bitfield) => {
                bitfield.resize(self.torrent.storage.piece_count, false);
                let interested = self
                    .piece_picker
                    .write()
                    .await
                    .update_bitfield(self.handle, bitfield.clone())?;
                if let Some(info) = &mut self.peer_info {
                    info.pieces = Some(bitfield);
                }
                self.become_interested_if(interested, sink).await?;
            }
            Message::Have { index } => {
                let interested =
                    self.piece_picker.write().await.update_peer_have(self.handle, index);
                if let Some(Some(pieces)) =
                    self.peer_info.as_mut().map(|info| info.pieces.as_mut())
                {
                    pieces.set(index, true);
                }
                self.become_interested_if(interested, sink).await?;
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.handle);
                    self.outgoing_requests.clear();
                    self.status.is_choked = true;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.handle);
                    self.status.is_choked = false;
                    self.unchoke_attempts = 0;
                    if self.status.best_request_queue_len.is_none() {
                        self.status.best_request_queue_len = Some(4);
                    }
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.handle);
                    self.status.is_peer_interested = true;
                    self.piece_picker.write().await.add_interested(self.handle);
                }
                if self.status.is_peer_choked {
                    let unchoked =
                        self.piece_picker.write().await.try_unchoke(self.handle);
                    if unchoked {
                        self.status.is_peer_choked = false;
                        sink.send(Message::Unchoke).await?;
                    }
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.handle);
                    self.status.is_peer_interested = false;
                    let mut picker = self.piece_picker.write().await;
                    picker.remove_interested(self.handle);
                    if !self.status.is_peer_choked {
                        picker.choke(self.handle);
                        drop(picker);
                        self.status.is_peer_choked = true;
                        sink.send(Message::Choke).await?;
                    }
                }
            }
            Message::Request(block) => {
                self.serve_request(sink, block).await?;
            }
            Message::Block { piece_index, offset, data } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;
                self.make_requests(sink).await?;
            }
            Message::Cancel(block) => {
                log::debug!("Peer {} cancelled request {:?}", self.handle, block);
            }
            Message::Port(_) => {
                // DHT is out of scope; the message is accepted but ignored.
            }
            Message::DoNotHave { index } => {
                log::debug!(
                    "Peer {} cannot serve piece {}, abandoning its requests",
                    self.handle,
                    index
                );
                self.abandon_piece(index).await;
            }
        }

        Ok(())
    }

    async fn become_interested_if(
        &mut self,
        interested: bool,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if interested && !self.status.is_interested {
            self.status.is_interested = true;
            log::info!("Interested in peer {}", self.handle);
            sink.send(Message::Interested).await?;
        }
        Ok(())
    }

    /// Drops any outstanding requests and the in-progress download for a
    /// piece the peer just told us it cannot serve, releasing the picker's
    /// outstanding entries so another peer can pick the blocks up.
    async fn abandon_piece(&mut self, index: PieceIndex) {
        let handle = self.handle;
        let mut picker = self.piece_picker.write().await;
        self.outgoing_requests.retain(|b| {
            if b.piece_index == index {
                picker.cancel(handle, b.piece_index, b.offset);
                false
            } else {
                true
            }
        });
        drop(picker);
        self.downloads.retain(|d| d.piece_index() != index);
    }

    /// Serves a single inbound block request, honoring choke state and
    /// falling back to `do-not-have` if the disk can't produce the block.
    async fn serve_request(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        block: BlockInfo,
    ) -> Result<()> {
        if self.status.is_peer_choked {
            log::debug!(
                "Ignoring request from choked peer {}: {:?}",
                self.handle,
                block
            );
            return Ok(());
        }

        match self.disk.read_block(self.torrent.id, block).await {
            Ok(data) => {
                sink.send(Message::Block {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data,
                })
                .await?;
            }
            Err(e) => {
                log::warn!(
                    "Could not read piece {} for peer {}: {}",
                    block.piece_index,
                    self.handle,
                    e
                );
                let supports_do_not_have = self
                    .peer_info
                    .as_ref()
                    .map_or(false, |info| info.supports_do_not_have);
                if supports_do_not_have {
                    sink.send(Message::DoNotHave {
                        index: block.piece_index,
                    })
                    .await?;
                } else {
                    // peer didn't signal support for the extension; BEP-3
                    // has no way to answer a request we can't serve, so we
                    // simply don't respond and let the peer's own request
                    // timeout handle it
                    log::debug!(
                        "Peer {} doesn't support do-not-have, dropping unservable request for piece {}",
                        self.handle,
                        block.piece_index
                    );
                }
            }
        }
        Ok(())
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        log::trace!("Making requests to peer {}", self.handle);

        let mut blocks = Vec::new();

        for download in self.downloads.iter_mut() {
            debug_assert!(
                self.status.best_request_queue_len.unwrap_or_default()
                    >= self.outgoing_requests.len()
            );
            let to_request_count = self
                .status
                .best_request_queue_len
                .unwrap_or_default()
                .saturating_sub(self.outgoing_requests.len());
            if to_request_count == 0 {
                break;
            }
            download.pick_blocks(to_request_count, &mut blocks);
        }

        loop {
            let request_queue_len = self
                .status
                .best_request_queue_len
                .unwrap_or_default()
                .saturating_sub(self.outgoing_requests.len());
            if request_queue_len == 0 {
                break;
            }

            let mut piece_picker = self.piece_picker.write().await;
            if let Some(index) = piece_picker.pick_piece() {
                drop(piece_picker);
                log::info!("Session {} picked piece {}", self.handle, index);
                let mut download =
                    PieceDownload::new(index, self.torrent.storage.piece_len(index)?);
                download.pick_blocks(request_queue_len, &mut blocks);
                self.downloads.push(download);
            } else {
                break;
            }
        }

        self.outgoing_requests.extend_from_slice(&blocks);
        for block in blocks.iter() {
            let mut picker = self.piece_picker.write().await;
            picker.add_request(self.handle, block.piece_index, block.offset);
            drop(picker);
            sink.send(Message::Request(*block)).await?;
        }

        Ok(())
    }

    /// Records an arrived block and queues it for disk writing, dropping
    /// the local download entry once every block of its piece has arrived.
    /// Hash verification (and the resulting `have` gossip) happens
    /// separately once the disk task finishes writing the piece.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::info!("Received block from peer {}: {:?}", self.handle, block_info);

        let block_pos = match self
            .outgoing_requests
            .iter()
            .position(|b| *b == block_info)
        {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Peer {} sent not requested block: {:?}",
                    self.handle,
                    block_info,
                );
                return Ok(());
            }
        };
        self.outgoing_requests.remove(block_pos);
        self.piece_picker.write().await.mark_completed(
            self.handle,
            block_info.piece_index,
            block_info.offset,
        );

        let download_pos = self
            .downloads
            .iter()
            .position(|d| d.piece_index() == block_info.piece_index);
        debug_assert!(download_pos.is_some());
        let download_pos = download_pos.unwrap();
        let download = &mut self.downloads[download_pos];
        download.received_block(&block_info);

        let missing_blocks_count = download.count_missing_blocks();
        if missing_blocks_count == 0 {
            log::info!(
                "All blocks for piece {} arrived via peer {}, handing off to disk for verification",
                block_info.piece_index,
                self.handle
            );
            // the piece isn't actually done until its hash checks out; that
            // happens asynchronously on the disk task, which is also what
            // updates the shared piece picker and gossips `have` once the
            // hash matches (see `engine::run_disk_alerts`)
            self.downloads.remove(download_pos);
        }

        self.disk.write_block(self.torrent.id, block_info, data)?;
        self.status.downloaded_block_bytes_count += block_info.len as u64;

        Ok(())
    }
}

/// Swaps a `Framed<TcpStream, HandshakeCodec>` for a `Framed<TcpStream,
/// PeerCodec>`, reusing the read/write buffers so that bytes the peer sent
/// right after the handshake aren't lost.
fn switch_codec(
    socket: Framed<TcpStream, HandshakeCodec>,
    piece_count: usize,
) -> Framed<TcpStream, PeerCodec> {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec { piece_count });
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

/// The channel on which the torrent can send a command to the peer session
/// task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
    /// The number of block requests we keep outstanding to the peer at
    /// once.
    best_request_queue_len: Option<usize>,
    /// The number of piece/block bytes downloaded.
    downloaded_block_bytes_count: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            best_request_queue_len: None,
            downloaded_block_bytes_count: 0,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected.
    Disconnected,
    /// The state during which the TCP connection is established (outbound
    /// only).
    Connecting,
    /// The state after establishing the TCP connection, while the
    /// handshake is exchanged.
    Handshaking,
    /// The normal state of a peer session, in which any message apart from
    /// the handshake may be exchanged.
    Connected,
    /// The session has ended.
    Closed,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// All pieces peer has, updated as it announces new ones.
    pieces: Option<Bitfield>,
    /// Whether the peer signaled support for the non-standard `do-not-have`
    /// (id 10) message in its handshake's reserved bytes.
    supports_do_not_have: bool,
}
