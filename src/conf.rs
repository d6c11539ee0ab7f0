//! This module defines types used to configure the engine and its parts.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

use crate::PeerId;

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::new(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The IP address the listener binds on, for accepting incoming peer
    /// connections.
    pub listen_ip: IpAddr,
    /// The port the listener binds on.
    pub listen_port: u16,
    /// How long a peer socket read may block before the session is dropped.
    pub read_timeout: Duration,
    /// The tracker announce interval floor: even if a tracker asks for more
    /// frequent announces, we never announce more often than this.
    pub announce_min_interval: Duration,
}

impl EngineConf {
    pub fn new() -> Self {
        Self {
            client_id: *CRATETORRENT_CLIENT_ID,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 6881,
            read_timeout: Duration::from_secs(60),
            announce_min_interval: Duration::from_secs(30),
        }
    }
}

impl Default for EngineConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// The number of unchoke slots a torrent extends to interested peers at
    /// once. Default 4.
    pub unchoke_capacity: usize,

    /// The number of blocks (here: whole pieces, since this implementation
    /// does not subdivide pieces into sub-piece blocks) kept outstanding per
    /// peer at once. Default 1.
    pub max_inflight_per_peer: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
            unchoke_capacity: 4,
            max_inflight_per_peer: 1,
        }
    }
}
