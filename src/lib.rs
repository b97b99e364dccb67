// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
pub mod error;
pub mod metainfo;
mod peer;
mod piece;
mod piece_manager;
mod storage_info;
pub mod torrent;
mod tracker;

use bitvec::prelude::{BitVec, Msb0};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// This is the only block length we're dealing with (except for possibly the
/// last block).  It is the widely used and accepted 16 KiB.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), except for
    /// possibly the very last block of the torrent.
    pub len: u32,
}

/// Returns the length of the block at the given block index within a piece of
/// the given length.
///
/// All blocks are [`BLOCK_LEN`] bytes long, except the last block of a piece
/// whose length is not an exact multiple of it: that block covers only the
/// remainder of the piece.
///
/// # Panics
///
/// Panics if the block would start at or past the end of the piece.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let offset = index as u32 * BLOCK_LEN;
    assert!(offset < piece_len);
    std::cmp::min(piece_len - offset, BLOCK_LEN)
}

/// Returns the number of blocks a piece of the given length is split into.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // round up so that a trailing partial block still counts as one
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}
