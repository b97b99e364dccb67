//! The in-memory model of a piece and the blocks it is downloaded in.
//!
//! A piece is the unit of hash verification, a block the unit of request: a
//! piece is split into 16 KiB blocks (the last block of the torrent may be
//! shorter) and each block is requested from a peer separately.

use sha1::{Digest, Sha1};

use crate::{block_count, block_len, BlockInfo, PieceIndex, Sha1Hash, BLOCK_LEN};

/// The download state of a single block within a piece.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BlockStatus {
    /// Not yet requested from any peer.
    Missing,
    /// Requested from at least one peer but not yet received.
    Pending,
    /// Received and buffered, waiting for the piece hash check.
    Retrieved,
}

/// A single block of a piece and, once retrieved, its data.
#[derive(Debug)]
pub(crate) struct Block {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes.
    pub len: u32,
    pub status: BlockStatus,
    /// Set when the block is retrieved, discarded once its piece has been
    /// verified and written to disk.
    pub data: Option<Vec<u8>>,
}

impl Block {
    fn new(piece_index: PieceIndex, offset: u32, len: u32) -> Self {
        Self {
            piece_index,
            offset,
            len,
            status: BlockStatus::Missing,
            data: None,
        }
    }

    /// Returns the wire level identifier of this block.
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_index: self.piece_index,
            offset: self.offset,
            len: self.len,
        }
    }
}

/// A piece under download: its expected hash and its blocks, covering
/// `[0, piece len)` contiguously in offset order.
#[derive(Debug)]
pub(crate) struct Piece {
    index: PieceIndex,
    hash: Sha1Hash,
    len: u32,
    blocks: Vec<Block>,
}

impl Piece {
    /// Creates the piece with all its blocks missing. All blocks are
    /// `BLOCK_LEN` long except possibly the last one, which covers the
    /// remainder of the piece.
    pub fn new(index: PieceIndex, hash: Sha1Hash, len: u32) -> Self {
        let block_count = block_count(len);
        let mut blocks = Vec::with_capacity(block_count);
        for block_index in 0..block_count {
            blocks.push(Block::new(
                index,
                block_index as u32 * BLOCK_LEN,
                block_len(len, block_index),
            ));
        }
        Self {
            index,
            hash,
            len,
            blocks,
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns the first missing block, marking it pending, or `None` if all
    /// blocks have been requested or retrieved already.
    pub fn next_request(&mut self) -> Option<BlockInfo> {
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.status == BlockStatus::Missing)?;
        block.status = BlockStatus::Pending;
        Some(block.info())
    }

    /// Records the data of a retrieved block. A delivery at an offset that is
    /// not a block boundary of this piece is logged and dropped.
    pub fn on_block(&mut self, offset: u32, data: Vec<u8>) {
        match self.blocks.iter_mut().find(|b| b.offset == offset) {
            Some(block) => {
                block.status = BlockStatus::Retrieved;
                block.data = Some(data);
            }
            None => log::warn!(
                "Piece {} has no block at offset {}",
                self.index,
                offset
            ),
        }
    }

    /// Returns true if all blocks of the piece have been retrieved.
    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.status == BlockStatus::Retrieved)
    }

    /// Calculates the piece's hash using all its blocks and returns whether it
    /// matches the expected hash.
    pub fn matches_hash(&self) -> bool {
        // sanity check that we only call this method if we have all blocks in
        // piece
        debug_assert!(self.is_complete());
        let mut hasher = Sha1::new();
        for block in self.blocks.iter() {
            if let Some(data) = &block.data {
                hasher.update(data);
            }
        }
        let hash = hasher.finalize();
        hash.as_slice() == self.hash
    }

    /// Concatenates the block data in offset order, for writing the verified
    /// piece to disk.
    pub fn assemble(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len as usize);
        for block in self.blocks.iter() {
            if let Some(data) = &block.data {
                buf.extend_from_slice(data);
            }
        }
        buf
    }

    /// Puts all blocks back to missing and drops their data. Used when the
    /// complete piece failed the hash check and has to be downloaded again.
    pub fn reset(&mut self) {
        for block in self.blocks.iter_mut() {
            block.status = BlockStatus::Missing;
            block.data = None;
        }
    }

    /// Drops the block data buffers while keeping their retrieved status.
    /// Called after the piece has been written to disk.
    pub fn discard_data(&mut self) {
        for block in self.blocks.iter_mut() {
            block.data = None;
        }
    }
}
