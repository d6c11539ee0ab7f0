//! The top-level torrent engine: owns the disk task, the listener that
//! accepts incoming peer connections, and the set of currently running
//! torrents.
//!
//! An [`Engine`] is cheap to clone and hand around; all of its state lives
//! behind `Arc`s and locks so that the listener, each torrent's announce
//! loop, and the caller can all reach it concurrently.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::RwLock,
};
use tokio_util::codec::Framed;

use crate::{
    conf::{Conf, TorrentConf},
    counter::next_torrent_id,
    disk::DiskHandle,
    error::Result,
    metainfo::Metainfo,
    peer::{Handshake, HandshakeCodec, PeerSession},
    torrent::{Torrent, TorrentHandle},
    tracker::{AnnounceParams, TrackerClient},
    PeerHandle, TorrentId,
};

/// How long the engine waits for peer sessions to wind down on shutdown
/// before giving up on them.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// The set of torrents the engine currently knows about, keyed by their
/// engine-local id. Shared between the public `Engine` handle, the listener
/// task (which needs to demultiplex inbound connections by info hash) and
/// each torrent's own announce loop.
type TorrentMap = Arc<RwLock<HashMap<TorrentId, Arc<Torrent>>>>;

/// A running torrent engine.
///
/// Cloning an `Engine` is cheap and yields another handle to the same
/// underlying engine; it does not spawn a second listener or a second disk
/// task.
#[derive(Clone)]
pub struct Engine {
    conf: Conf,
    disk: DiskHandle,
    torrents: TorrentMap,
}

impl Engine {
    /// Starts the engine: spawns the disk task and the inbound connection
    /// listener, both of which run until the engine is dropped or
    /// [`Engine::shutdown`] is called.
    pub async fn new(conf: Conf) -> Result<Self> {
        let disk = DiskHandle::spawn()?;
        let torrents = Arc::new(RwLock::new(HashMap::new()));

        let listen_addr = SocketAddr::new(conf.engine.listen_ip, conf.engine.listen_port);
        let listener = TcpListener::bind(listen_addr).await?;
        log::info!("Listening for incoming peer connections on {}", listen_addr);

        tokio::spawn(run_listener(
            listener,
            Arc::clone(&torrents),
            disk.clone(),
        ));

        Ok(Self {
            conf,
            disk,
            torrents,
        })
    }

    /// Adds a new torrent to the engine: allocates its on-disk storage,
    /// verifies whatever of it is already present, and starts its announce
    /// loop. Returns a handle the caller can use to query its progress.
    pub async fn add_torrent(&self, metainfo: Metainfo) -> Result<TorrentHandle> {
        self.add_torrent_with_conf(metainfo, self.conf.torrent.clone())
            .await
    }

    /// Like [`Engine::add_torrent`], but overrides the engine's default
    /// per-torrent configuration.
    pub async fn add_torrent_with_conf(
        &self,
        metainfo: Metainfo,
        torrent_conf: TorrentConf,
    ) -> Result<TorrentHandle> {
        let id = next_torrent_id();
        log::info!(
            "Adding torrent {} ({}), info hash {}",
            id,
            metainfo.name,
            hex::encode(metainfo.info_hash)
        );

        let torrent = Torrent::new(
            id,
            &metainfo,
            self.conf.engine.client_id,
            torrent_conf,
            self.disk.clone(),
        );

        let allocation = self
            .disk
            .new_torrent(id, torrent.status.storage.clone(), metainfo.pieces.clone())
            .await?;

        let bitfield = self.disk.verify_on_load(id).await?;
        torrent.seed_own_bitfield(bitfield).await;

        let torrent = Arc::new(torrent);
        self.torrents
            .write()
            .await
            .insert(id, Arc::clone(&torrent));

        tokio::spawn(run_disk_alerts(Arc::clone(&torrent), allocation.alert_port));
        tokio::spawn(run_announce_loop(
            self.conf.clone(),
            Arc::clone(&torrent),
            metainfo.tracker_url.clone(),
            self.disk.clone(),
        ));

        Ok(TorrentHandle::new(torrent))
    }

    /// Signals every torrent's sessions to shut down and waits up to about a
    /// second for them to wind down cooperatively.
    pub async fn shutdown(&self) -> Result<()> {
        log::info!("Shutting down engine");
        let torrents = self.torrents.read().await;
        for torrent in torrents.values() {
            torrent.shutdown_sessions();
        }
        drop(torrents);

        // sessions close their TCP connection and exit their task as part
        // of winding down; give them a grace period rather than tearing the
        // process down under them
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;

        self.disk.shutdown()?;
        Ok(())
    }
}

/// Accepts inbound connections and, for each, reads the handshake itself
/// (before any torrent-specific `PeerSession` exists) in order to determine
/// which torrent the connection belongs to.
async fn run_listener(listener: TcpListener, torrents: TorrentMap, disk: DiskHandle) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("Failed to accept incoming connection: {}", e);
                continue;
            }
        };
        log::info!("Accepted incoming connection from {}", addr);
        tokio::spawn(handle_inbound(socket, addr, Arc::clone(&torrents), disk.clone()));
    }
}

async fn handle_inbound(socket: TcpStream, addr: SocketAddr, torrents: TorrentMap, disk: DiskHandle) {
    let mut framed = Framed::new(socket, HandshakeCodec);
    let handshake: Handshake = match framed.next().await {
        Some(Ok(handshake)) => handshake,
        Some(Err(e)) => {
            log::debug!("Rejecting connection from {}: {}", addr, e);
            return;
        }
        None => return,
    };

    let torrent = {
        let torrents = torrents.read().await;
        torrents
            .values()
            .find(|t| t.status.info_hash == handshake.info_hash)
            .cloned()
    };
    let torrent = match torrent {
        Some(torrent) => torrent,
        None => {
            log::debug!(
                "Rejecting connection from {}: no torrent for info hash {}",
                addr,
                hex::encode(handshake.info_hash)
            );
            return;
        }
    };

    let handle = PeerHandle::from(addr);
    if torrent.is_connected(handle) {
        log::debug!("Already connected to {}, dropping duplicate connection", addr);
        return;
    }

    let (mut session, chan) = PeerSession::inbound(
        Arc::clone(&torrent.status),
        Arc::clone(&torrent.piece_picker),
        disk,
        addr,
    );
    torrent.register_session(handle, chan);
    if let Err(e) = session.start_inbound(framed, handshake).await {
        log::info!("Inbound session with {} ended: {}", addr, e);
    }
    torrent.deregister_session(handle);
}

/// Drains a torrent's disk alerts, updating its piece picker and gossiping
/// `have` to every connected session whenever a piece completes.
async fn run_disk_alerts(
    torrent: Arc<Torrent>,
    mut alert_port: crate::disk::TorrentAlertReceiver,
) {
    use crate::disk::TorrentAlert;

    while let Some(alert) = alert_port.recv().await {
        match alert {
            TorrentAlert::BatchWrite(Ok(batch)) => {
                let index = batch.piece_index;
                match batch.is_piece_valid {
                    Some(true) => {
                        torrent.piece_picker.write().await.received_piece(index);
                        let _ = torrent.status.have_tx.send(index);
                        log::info!("Torrent {} piece {} complete", torrent.status.id, index);
                    }
                    Some(false) => {
                        log::warn!(
                            "Torrent {} piece {} failed hash verification, will retry",
                            torrent.status.id,
                            index
                        );
                        torrent.piece_picker.write().await.release_picked(index);
                    }
                    None => {}
                }
            }
            TorrentAlert::BatchWrite(Err(e)) => {
                log::warn!("Torrent {} disk write failure: {}", torrent.status.id, e);
            }
        }
    }
}

/// Periodically announces to the torrent's tracker and dials whatever peers
/// it returns that we aren't already connected to.
async fn run_announce_loop(
    conf: Conf,
    torrent: Arc<Torrent>,
    tracker_url: String,
    disk: DiskHandle,
) {
    let tracker = TrackerClient::new(tracker_url);
    let mut error_count = 0usize;

    loop {
        let is_seed = torrent.is_seed().await;
        let params = AnnounceParams {
            info_hash: torrent.status.info_hash,
            peer_id: torrent.status.client_id,
            ip: None,
            port: conf.engine.listen_port,
            downloaded: 0,
            uploaded: 0,
            is_seeder: is_seed,
        };

        let interval = match tracker.announce(params).await {
            Ok(resp) => {
                error_count = 0;
                let interval = resp.interval(conf.engine.announce_min_interval);
                for peer in resp.peers {
                    let addr = peer.addr();
                    let handle = PeerHandle::from(addr);
                    if torrent.is_connected(handle) {
                        continue;
                    }
                    if addr.port() == conf.engine.listen_port {
                        // best-effort guard against dialing ourselves when
                        // the tracker echoes our own announce back
                        continue;
                    }
                    if torrent.sessions.lock().unwrap().len()
                        >= torrent.conf.max_connected_peer_count
                    {
                        break;
                    }
                    spawn_outbound(Arc::clone(&torrent), disk.clone(), addr);
                }

                match tracker.scrape(torrent.status.info_hash).await {
                    Ok(scrape) => {
                        let key = hex::encode(torrent.status.info_hash);
                        if let Some(entry) = scrape.files.get(&key) {
                            log::debug!(
                                "Torrent {} swarm: {} seeders, {} leechers, {} completed",
                                torrent.status.id,
                                entry.complete,
                                entry.incomplete,
                                entry.downloaded
                            );
                        }
                    }
                    Err(e) => {
                        // scrape is an optional, best-effort extra; a tracker
                        // that doesn't support it shouldn't affect announcing
                        log::debug!("Torrent {} scrape failed: {}", torrent.status.id, e);
                    }
                }

                interval
            }
            Err(e) => {
                error_count += 1;
                log::warn!(
                    "Torrent {} announce failed ({}/{}): {}",
                    torrent.status.id,
                    error_count,
                    torrent.conf.tracker_error_threshold,
                    e
                );
                if error_count >= torrent.conf.tracker_error_threshold {
                    log::error!(
                        "Torrent {} exceeded tracker error threshold, giving up announcing \
                         (the torrent keeps running on its last-known peer list; inbound \
                         connections are unaffected)",
                        torrent.status.id
                    );
                    return;
                }
                conf.engine.announce_min_interval
            }
        };

        tokio::time::sleep(interval).await;
    }
}

fn spawn_outbound(torrent: Arc<Torrent>, disk: DiskHandle, addr: SocketAddr) {
    let handle = PeerHandle::from(addr);
    let (mut session, chan) = PeerSession::outbound(
        Arc::clone(&torrent.status),
        Arc::clone(&torrent.piece_picker),
        disk,
        addr,
    );
    torrent.register_session(handle, chan);
    tokio::spawn(async move {
        if let Err(e) = session.start_outbound().await {
            log::info!("Outbound session with {} ended: {}", addr, e);
        }
        torrent.deregister_session(handle);
    });
}
