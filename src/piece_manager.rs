//! The piece manager decides which block to download next, keeps track of
//! outstanding requests so they can be reissued after a timeout, verifies
//! completed pieces against their expected hashes and writes them to disk.
//!
//! Pieces move through three buckets: `missing` (not started), `ongoing` (at
//! least one block requested) and `have` (verified and persisted). The
//! buckets are disjoint and together always cover the whole piece set.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    time::{Duration, Instant},
};

use crate::{
    error::{Error, Result},
    piece::Piece,
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// An outstanding block request and the time it was first handed out, kept so
/// that requests lost to slow or vanished peers can be reissued.
#[derive(Debug)]
struct PendingRequest {
    block: BlockInfo,
    first_requested: Instant,
}

pub(crate) struct PieceManager {
    storage: StorageInfo,
    /// Pieces not yet started.
    missing: Vec<Piece>,
    /// Pieces with at least one requested block, not yet verified.
    ongoing: Vec<Piece>,
    /// Verified pieces, written to disk.
    have: Vec<Piece>,
    /// The claimed pieces of each connected peer, keyed by its handshake id.
    peers: HashMap<PeerId, Bitfield>,
    /// All outstanding block requests, across all peers.
    pending: Vec<PendingRequest>,
    /// Requests older than this are handed out again.
    max_pending_time: Duration,
    /// The output file. Its length is set up front so that absolute offset
    /// writes are always within bounds.
    file: File,
}

impl PieceManager {
    /// Creates the manager with every piece missing and opens the output
    /// file, sizing it to the download length.
    pub fn new(
        storage: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        max_pending_time: Duration,
    ) -> Result<Self> {
        debug_assert_eq!(piece_hashes.len(), storage.piece_count);

        let mut missing = Vec::with_capacity(storage.piece_count);
        for (index, hash) in piece_hashes.into_iter().enumerate() {
            missing.push(Piece::new(index, hash, storage.piece_len(index)?));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&storage.file_path)
            .map_err(Error::Disk)?;
        file.set_len(storage.download_len).map_err(Error::Disk)?;
        log::info!(
            "Created output file {:?} of {} bytes",
            storage.file_path,
            storage.download_len
        );

        Ok(Self {
            storage,
            missing,
            ongoing: Vec::new(),
            have: Vec::new(),
            peers: HashMap::new(),
            pending: Vec::new(),
            max_pending_time,
            file,
        })
    }

    /// Registers a peer and the pieces it claims to have. An existing
    /// registration for the same id is replaced.
    pub fn add_peer(&mut self, peer_id: PeerId, bitfield: Bitfield) {
        debug_assert_eq!(bitfield.len(), self.storage.piece_count);
        log::debug!(
            "Peer {} claims {} pieces",
            hex::encode(&peer_id),
            bitfield.count_ones()
        );
        self.peers.insert(peer_id, bitfield);
    }

    /// Records that a peer has announced a new piece via a have message.
    pub fn update_peer(&mut self, peer_id: &PeerId, piece_index: PieceIndex) {
        if let Some(bitfield) = self.peers.get_mut(peer_id) {
            if piece_index < bitfield.len() {
                bitfield.set(piece_index, true);
            } else {
                log::warn!(
                    "Peer {} announced invalid piece {}",
                    hex::encode(peer_id),
                    piece_index
                );
            }
        }
    }

    /// Removes a disconnected peer from the availability map.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    /// Returns the next block to request from the given peer, or `None` if no
    /// piece the peer claims remains unfinished.
    ///
    /// Expired outstanding requests are reissued first, then blocks of
    /// already started pieces, and only then is a new piece started, rarest
    /// first.
    pub fn next_request(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        if !self.peers.contains_key(peer_id) {
            return None;
        }
        let block = self.expired_request(peer_id);
        if block.is_some() {
            return block;
        }
        let block = self.next_ongoing(peer_id);
        if block.is_some() {
            return block;
        }
        self.start_rarest(peer_id)
    }

    /// Delivers a retrieved block. When this completes its piece, the piece
    /// is verified and either written to disk or reset for re-download.
    ///
    /// Only a failure of the output file is an error; a block we can't place
    /// is logged and dropped.
    pub fn block_received(
        &mut self,
        peer_id: &PeerId,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!(
            "Received block at offset {} of piece {} from peer {}",
            offset,
            piece_index,
            hex::encode(peer_id)
        );

        if let Some(pos) = self.pending.iter().position(|r| {
            r.block.piece_index == piece_index && r.block.offset == offset
        }) {
            self.pending.remove(pos);
        }

        let pos = match self
            .ongoing
            .iter()
            .position(|piece| piece.index() == piece_index)
        {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Dropping block for piece {} that is not being downloaded",
                    piece_index
                );
                return Ok(());
            }
        };

        let piece = &mut self.ongoing[pos];
        piece.on_block(offset, data);
        if piece.is_complete() {
            if piece.matches_hash() {
                self.write_piece(pos)?;
            } else {
                // the piece stays in the ongoing bucket: its blocks are now
                // missing again and are picked up by the ongoing walk
                log::warn!(
                    "Piece {} failed the hash check, discarding",
                    piece_index
                );
                piece.reset();
            }
        }
        Ok(())
    }

    /// Returns true if all pieces have been downloaded and verified.
    pub fn is_complete(&self) -> bool {
        self.have.len() == self.storage.piece_count
    }

    /// The number of downloaded bytes, counting verified pieces only.
    pub fn bytes_downloaded(&self) -> u64 {
        self.have.iter().map(|piece| piece.len() as u64).sum()
    }

    /// The number of uploaded bytes. Always zero: this engine doesn't seed.
    pub fn bytes_uploaded(&self) -> u64 {
        0
    }

    /// Flushes the output file. The descriptor itself is released when the
    /// manager is dropped.
    pub fn close(&mut self) -> Result<()> {
        self.file.sync_all().map_err(Error::Disk)
    }

    /// Scans the pending request table for a request that has been
    /// outstanding longer than the timeout and that the given peer can serve.
    /// The matched entry has its timestamp refreshed but stays in the table.
    fn expired_request(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let bitfield = self.peers.get(peer_id)?;
        let now = Instant::now();
        for request in self.pending.iter_mut() {
            if bitfield[request.block.piece_index]
                && now.duration_since(request.first_requested)
                    >= self.max_pending_time
            {
                log::info!("Re-requesting expired block {:?}", request.block);
                request.first_requested = now;
                return Some(request.block);
            }
        }
        None
    }

    /// Walks the ongoing pieces in order and returns the first missing block
    /// of the first piece the peer claims that still has one.
    fn next_ongoing(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let bitfield = self.peers.get(peer_id)?;
        for piece in self.ongoing.iter_mut() {
            if !bitfield[piece.index()] {
                continue;
            }
            if let Some(block) = piece.next_request() {
                self.pending.push(PendingRequest {
                    block,
                    first_requested: Instant::now(),
                });
                return Some(block);
            }
        }
        None
    }

    /// Starts the download of the rarest missing piece the peer claims: the
    /// one claimed by the fewest known peers, ties broken by bucket order.
    /// The piece moves to the ongoing bucket and its first block is returned.
    fn start_rarest(&mut self, peer_id: &PeerId) -> Option<BlockInfo> {
        let bitfield = self.peers.get(peer_id)?;
        let mut rarest: Option<(usize, usize)> = None;
        for (pos, piece) in self.missing.iter().enumerate() {
            if !bitfield[piece.index()] {
                continue;
            }
            let count = self
                .peers
                .values()
                .filter(|peer| peer[piece.index()])
                .count();
            match rarest {
                Some((_, best)) if best <= count => {}
                _ => rarest = Some((pos, count)),
            }
        }

        let (pos, _) = rarest?;
        let mut piece = self.missing.remove(pos);
        log::debug!("Starting piece {}", piece.index());
        let block = piece.next_request();
        self.ongoing.push(piece);
        // a piece fresh out of the missing bucket always has a missing block
        let block = block?;
        self.pending.push(PendingRequest {
            block,
            first_requested: Instant::now(),
        });
        Some(block)
    }

    /// Writes the verified piece at `pos` in the ongoing bucket to its offset
    /// in the output file and moves it to the have bucket.
    fn write_piece(&mut self, pos: usize) -> Result<()> {
        let piece = &self.ongoing[pos];
        let offset = self.storage.piece_offset(piece.index());
        self.file
            .write_all_at(&piece.assemble(), offset)
            .map_err(Error::Disk)?;

        let mut piece = self.ongoing.remove(pos);
        piece.discard_data();
        self.have.push(piece);

        let have_count = self.have.len();
        log::info!(
            "{}/{} pieces downloaded ({:.3} %)",
            have_count,
            self.storage.piece_count,
            100.0 * have_count as f64 / self.storage.piece_count as f64
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::test_storage;
    use bitvec::prelude::BitVec;
    use pretty_assertions::assert_eq;
    use sha1::{Digest, Sha1};

    const PEER_A: PeerId = [0xaa; 20];
    const PEER_B: PeerId = [0xbb; 20];

    fn digest(data: &[u8]) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&Sha1::digest(data));
        hash
    }

    fn make_manager(
        piece_len: u32,
        pieces: &[&[u8]],
        file_name: &str,
        max_pending_time: Duration,
    ) -> PieceManager {
        let download_len = pieces.iter().map(|p| p.len() as u64).sum();
        let file_name =
            format!("leechtorrent-test-{}-{}", std::process::id(), file_name);
        let storage = test_storage(piece_len, download_len, &file_name);
        let hashes = pieces.iter().map(|p| digest(p)).collect();
        PieceManager::new(storage, hashes, max_pending_time).unwrap()
    }

    fn full_bitfield(piece_count: usize) -> Bitfield {
        BitVec::repeat(true, piece_count)
    }

    fn claims(piece_count: usize, indices: &[PieceIndex]) -> Bitfield {
        let mut bitfield = BitVec::repeat(false, piece_count);
        for index in indices {
            bitfield.set(*index, true);
        }
        bitfield
    }

    fn read_output(manager: &PieceManager) -> Vec<u8> {
        std::fs::read(&manager.storage.file_path).unwrap()
    }

    fn assert_buckets_disjoint(manager: &PieceManager) {
        let total = manager.missing.len()
            + manager.ongoing.len()
            + manager.have.len();
        assert_eq!(total, manager.storage.piece_count);
        let mut seen: Vec<PieceIndex> = manager
            .missing
            .iter()
            .chain(manager.ongoing.iter())
            .chain(manager.have.iter())
            .map(|piece| piece.index())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn test_download_completes_and_writes_file() {
        let mut manager = make_manager(
            4,
            &[b"abcd", b"efgh"],
            "complete",
            Duration::from_secs(300),
        );
        manager.add_peer(PEER_A, full_bitfield(2));
        assert_buckets_disjoint(&manager);

        let first = manager.next_request(&PEER_A).unwrap();
        manager
            .block_received(
                &PEER_A,
                first.piece_index,
                first.offset,
                b"abcd".to_vec(),
            )
            .unwrap();
        assert_eq!(manager.bytes_downloaded(), 4);
        assert!(!manager.is_complete());
        assert_buckets_disjoint(&manager);

        let second = manager.next_request(&PEER_A).unwrap();
        manager
            .block_received(
                &PEER_A,
                second.piece_index,
                second.offset,
                b"efgh".to_vec(),
            )
            .unwrap();

        assert!(manager.is_complete());
        assert_eq!(manager.bytes_downloaded(), 8);
        assert_eq!(manager.bytes_uploaded(), 0);
        assert_eq!(read_output(&manager), b"abcdefgh");
        assert_buckets_disjoint(&manager);
    }

    #[test]
    fn test_corrupt_piece_is_reset_and_redownloaded() {
        let mut manager = make_manager(
            4,
            &[b"abcd", b"efgh"],
            "corrupt",
            Duration::from_secs(300),
        );
        manager.add_peer(PEER_A, full_bitfield(2));

        let first = manager.next_request(&PEER_A).unwrap();
        assert_eq!(first.piece_index, 0);
        manager
            .block_received(&PEER_A, 0, 0, b"abcd".to_vec())
            .unwrap();

        let second = manager.next_request(&PEER_A).unwrap();
        assert_eq!(second.piece_index, 1);
        // a corrupt block: the piece completes, fails the hash check and is
        // reset without anything being written
        manager
            .block_received(&PEER_A, 1, 0, b"XXXX".to_vec())
            .unwrap();
        assert!(!manager.is_complete());
        assert_eq!(manager.ongoing.len(), 1);
        assert_eq!(manager.have.len(), 1);
        assert_eq!(read_output(&manager), b"abcd\0\0\0\0");
        assert_buckets_disjoint(&manager);

        // the same block is offered again and the correct data completes the
        // download
        let retry = manager.next_request(&PEER_A).unwrap();
        assert_eq!(retry.piece_index, 1);
        assert_eq!(retry.offset, 0);
        manager
            .block_received(&PEER_A, 1, 0, b"efgh".to_vec())
            .unwrap();
        assert!(manager.is_complete());
        assert_eq!(read_output(&manager), b"abcdefgh");
    }

    #[test]
    fn test_rarest_piece_is_started_first() {
        let mut manager = make_manager(
            4,
            &[b"abcd", b"efgh"],
            "rarest",
            Duration::from_secs(300),
        );
        // piece 0 is claimed only by peer A, piece 1 by both
        manager.add_peer(PEER_A, claims(2, &[0, 1]));
        manager.add_peer(PEER_B, claims(2, &[1]));

        let block = manager.next_request(&PEER_A).unwrap();
        assert_eq!(block.piece_index, 0);
    }

    #[test]
    fn test_rarest_tie_breaks_on_first_missing_piece() {
        let mut manager = make_manager(
            4,
            &[b"abcd", b"efgh", b"ijkl"],
            "tie",
            Duration::from_secs(300),
        );
        manager.add_peer(PEER_A, full_bitfield(3));

        let block = manager.next_request(&PEER_A).unwrap();
        assert_eq!(block.piece_index, 0);
    }

    #[test]
    fn test_expired_request_is_reissued() {
        let mut manager = make_manager(
            4,
            &[b"abcd", b"efgh"],
            "expiry",
            Duration::from_millis(50),
        );
        manager.add_peer(PEER_A, claims(2, &[0]));

        let block = manager.next_request(&PEER_A).unwrap();
        assert_eq!(block.piece_index, 0);
        assert_eq!(manager.pending.len(), 1);

        // peer A vanishes without delivering; after the timeout peer B must
        // be offered the expired block before any never requested piece
        std::thread::sleep(Duration::from_millis(60));
        manager.add_peer(PEER_B, full_bitfield(2));
        let reissued = manager.next_request(&PEER_B).unwrap();
        assert_eq!(reissued, block);
        // the entry was refreshed in place, not duplicated
        assert_eq!(manager.pending.len(), 1);

        // with a fresh timestamp the request is no longer expired, so peer B
        // is handed the start of the untouched piece instead
        let fresh = manager.next_request(&PEER_B).unwrap();
        assert_eq!(fresh.piece_index, 1);
    }

    #[test]
    fn test_unknown_or_removed_peer_gets_no_request() {
        let mut manager = make_manager(
            4,
            &[b"abcd"],
            "unknown-peer",
            Duration::from_secs(300),
        );
        assert_eq!(manager.next_request(&PEER_A), None);

        manager.add_peer(PEER_A, full_bitfield(1));
        manager.remove_peer(&PEER_A);
        assert_eq!(manager.next_request(&PEER_A), None);
    }

    #[test]
    fn test_have_update_makes_piece_requestable() {
        let mut manager = make_manager(
            4,
            &[b"abcd", b"efgh"],
            "have-update",
            Duration::from_secs(300),
        );
        manager.add_peer(PEER_A, claims(2, &[]));
        assert_eq!(manager.next_request(&PEER_A), None);

        manager.update_peer(&PEER_A, 1);
        let block = manager.next_request(&PEER_A).unwrap();
        assert_eq!(block.piece_index, 1);
    }

    #[test]
    fn test_block_for_unstarted_piece_is_dropped() {
        let mut manager = make_manager(
            4,
            &[b"abcd"],
            "unstarted",
            Duration::from_secs(300),
        );
        manager.add_peer(PEER_A, full_bitfield(1));

        // no request was ever made for piece 0
        manager
            .block_received(&PEER_A, 0, 0, b"abcd".to_vec())
            .unwrap();
        assert!(!manager.is_complete());
        assert_eq!(manager.missing.len(), 1);
        assert_eq!(read_output(&manager), b"\0\0\0\0");
    }
}
