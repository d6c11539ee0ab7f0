//! Tracks the block-level progress of a single in-progress piece download.
//!
//! A [`PieceDownload`] doesn't know or care which peer requested which
//! block: ownership of a request (so that the same block isn't requested
//! from two peers at once) is the download queue's job. This type only
//! tracks, for one piece, which blocks have been requested and which have
//! arrived.

use std::collections::HashSet;

use crate::{block_count, block_len, BlockInfo, PieceIndex, BLOCK_LEN};

pub(crate) struct PieceDownload {
    piece_index: PieceIndex,
    piece_len: u32,
    block_count: usize,
    requested: HashSet<u32>,
    received: HashSet<u32>,
}

impl PieceDownload {
    pub fn new(piece_index: PieceIndex, piece_len: u32) -> Self {
        Self {
            piece_index,
            piece_len,
            block_count: block_count(piece_len),
            requested: HashSet::new(),
            received: HashSet::new(),
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.piece_index
    }

    /// Appends up to `count` not yet requested blocks to `blocks`, marking
    /// them as requested.
    pub fn pick_blocks(&mut self, count: usize, blocks: &mut Vec<BlockInfo>) {
        for index in 0..self.block_count {
            if blocks.len() >= count {
                break;
            }
            let index = index as u32;
            if self.requested.contains(&index) {
                continue;
            }
            self.requested.insert(index);
            blocks.push(BlockInfo {
                piece_index: self.piece_index,
                offset: index * BLOCK_LEN,
                len: block_len(self.piece_len, index as usize),
            });
        }
    }

    /// Records that a block has arrived.
    pub fn received_block(&mut self, block_info: &BlockInfo) {
        self.received.insert(block_info.index_in_piece() as u32);
    }

    /// Returns the number of blocks that have not yet arrived.
    pub fn count_missing_blocks(&self) -> usize {
        self.block_count - self.received.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_each_block_once() {
        let mut download = PieceDownload::new(0, 2 * BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(10, &mut blocks);
        assert_eq!(blocks.len(), 2);
        let mut more = Vec::new();
        download.pick_blocks(10, &mut more);
        assert!(more.is_empty());
    }

    #[test]
    fn tracks_missing_blocks() {
        let mut download = PieceDownload::new(0, 2 * BLOCK_LEN);
        assert_eq!(download.count_missing_blocks(), 2);
        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        download.received_block(&blocks[0]);
        assert_eq!(download.count_missing_blocks(), 1);
        download.received_block(&blocks[1]);
        assert_eq!(download.count_missing_blocks(), 0);
    }

    #[test]
    fn last_block_is_shorter_for_uneven_piece() {
        let piece_len = BLOCK_LEN + 100;
        let mut download = PieceDownload::new(0, piece_len);
        let mut blocks = Vec::new();
        download.pick_blocks(10, &mut blocks);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].len, 100);
    }
}
