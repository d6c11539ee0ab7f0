//! A process-wide generator of unique [`TorrentId`]s.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::TorrentId;

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

/// Returns a [`TorrentId`] that is unique within this process.
pub(crate) fn next_torrent_id() -> TorrentId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct() {
        let a = next_torrent_id();
        let b = next_torrent_id();
        assert_ne!(a, b);
    }
}
