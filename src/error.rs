//! Crate-wide error types.
//!
//! Per-piece and per-session failures never propagate as process-fatal
//! errors: they're caught at the boundary of the subsystem that produced
//! them (disk IO, a single peer session, a single tracker announce) and
//! turned into a state change (bitfield bit stays clear, session closes,
//! next announce retries) instead. Only codec bugs that imply a corrupted
//! framer are allowed to bubble up further.

use thiserror::Error;

/// The crate's result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("metainfo is not valid bencode: {0}")]
    Metainfo(#[from] serde_bencode::Error),

    #[error("metainfo piece count does not match file sizes or pieces hash")]
    MetainfoInconsistent,

    #[error("file IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece hash did not match expected value")]
    HashMismatch,

    #[error("malformed wire message: {0}")]
    MalformedMessage(String),

    #[error("peer handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("tracker request failed: {0}")]
    TrackerUnavailable(#[from] reqwest::Error),

    #[error("invalid piece index")]
    InvalidPieceIndex,

    #[error("invalid torrent id")]
    InvalidTorrentId,

    #[error("operation cancelled during shutdown")]
    Cancelled,

    #[error("internal channel closed unexpectedly")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

/// Failure modes of allocating a new torrent's on-disk storage.
#[derive(Error, Debug)]
pub enum NewTorrentError {
    #[error("torrent already exists in this engine")]
    AlreadyExists,
    #[error("IO error while preparing torrent storage: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure modes of a single block write.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("invalid piece index")]
    InvalidPieceIndex,
    #[error("IO error while writing piece to disk: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure modes of the handshake exchange.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("protocol string did not match the expected BitTorrent protocol string")]
    InvalidProtocol,
    #[error("info hash advertised by peer does not match ours")]
    InfoHashMismatch,
    #[error("IO error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

impl From<NewTorrentError> for Error {
    fn from(e: NewTorrentError) -> Self {
        match e {
            NewTorrentError::AlreadyExists => Error::InvalidTorrentId,
            NewTorrentError::Io(e) => Error::Io(e),
        }
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::InvalidPieceIndex => Error::InvalidPieceIndex,
            WriteError::Io(e) => Error::Io(e),
        }
    }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::InvalidProtocol => {
                Error::HandshakeRejected("invalid protocol string".into())
            }
            HandshakeError::InfoHashMismatch => {
                Error::HandshakeRejected("info hash mismatch".into())
            }
            HandshakeError::Io(e) => Error::Io(e),
        }
    }
}
