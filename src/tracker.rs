//! A thin JSON HTTP client for the tracker endpoints this engine consumes.
//!
//! This is deliberately not the BEP-3 bencode-over-HTTP tracker protocol:
//! the tracker this core talks to exposes a small JSON API instead
//! (`announce`, `scrape`). The request/response shapes mirror an
//! `announce`/`scrape` pair rather than parsing a compact peer list out of
//! a bencoded dictionary.

use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::Result, PeerId, Sha1Hash};

/// A tracker client bound to a single tracker's base URL.
pub(crate) struct TrackerClient {
    http: reqwest::Client,
    base_url: String,
}

impl TrackerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Announces our presence to the tracker and returns the peer list and
    /// the interval to wait before announcing again.
    pub async fn announce(&self, params: AnnounceParams) -> Result<AnnounceResponse> {
        let url = format!("{}/announce", self.base_url.trim_end_matches('/'));
        log::debug!("Announcing to tracker at {}", url);
        let resp = self
            .http
            .post(&url)
            .json(&AnnounceRequest {
                info_hash: hex::encode(params.info_hash),
                peer_id: hex::encode(params.peer_id),
                ip: params.ip,
                port: params.port,
                downloaded: params.downloaded,
                uploaded: params.uploaded,
                is_seeder: params.is_seeder,
            })
            .send()
            .await?
            .json::<AnnounceResponse>()
            .await?;
        log::debug!(
            "Tracker returned {} peers, interval {}s",
            resp.peers.len(),
            resp.interval
        );
        Ok(resp)
    }

    /// Queries the tracker's scrape endpoint for swarm statistics, if it
    /// supports one.
    pub async fn scrape(&self, info_hash: Sha1Hash) -> Result<ScrapeResponse> {
        let url = format!(
            "{}/scrape?info_hash={}",
            self.base_url.trim_end_matches('/'),
            hex::encode(info_hash)
        );
        let resp = self.http.get(&url).send().await?.json().await?;
        Ok(resp)
    }
}

/// Everything the tracker needs to know about us for a single announce.
pub(crate) struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub downloaded: u64,
    pub uploaded: u64,
    pub is_seeder: bool,
}

#[derive(Serialize)]
struct AnnounceRequest {
    info_hash: String,
    peer_id: String,
    ip: Option<IpAddr>,
    port: u16,
    downloaded: u64,
    uploaded: u64,
    is_seeder: bool,
}

#[derive(Deserialize, Debug)]
pub(crate) struct AnnounceResponse {
    pub peers: Vec<TrackerPeer>,
    pub interval: u64,
}

impl AnnounceResponse {
    /// Returns the announce interval clamped to the engine's configured
    /// floor, so a misbehaving or malicious tracker can't make us hammer it.
    pub fn interval(&self, min_interval: Duration) -> Duration {
        Duration::from_secs(self.interval).max(min_interval)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct TrackerPeer {
    #[serde(default)]
    pub peer_id: Option<String>,
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub is_seeder: bool,
}

impl TrackerPeer {
    pub fn addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

#[derive(Deserialize, Debug)]
pub(crate) struct ScrapeResponse {
    pub files: std::collections::HashMap<String, ScrapeEntry>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ScrapeEntry {
    pub complete: u64,
    pub incomplete: u64,
    pub downloaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_response_interval_is_clamped_to_the_floor() {
        let resp = AnnounceResponse {
            peers: Vec::new(),
            interval: 5,
        };
        assert_eq!(
            resp.interval(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn announce_response_interval_honors_a_longer_tracker_value() {
        let resp = AnnounceResponse {
            peers: Vec::new(),
            interval: 120,
        };
        assert_eq!(
            resp.interval(Duration::from_secs(30)),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn tracker_peer_builds_socket_addr() {
        let peer = TrackerPeer {
            peer_id: None,
            ip: "127.0.0.1".parse().unwrap(),
            port: 6881,
            is_seeder: true,
        };
        assert_eq!(peer.addr().port(), 6881);
    }
}
