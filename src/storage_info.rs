//! Storage related facts derived from the metainfo: piece geometry and the
//! location of the output file.

use std::path::PathBuf;

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    PieceIndex,
};

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The length of the downloaded file.
    pub download_len: u64,
    /// Where the downloaded file is written: the download directory joined by
    /// the torrent's name.
    pub file_path: PathBuf,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.total_size();
        let piece_len = metainfo.info.piece_length as u32;
        let last_piece_len = if piece_count == 0 {
            0
        } else {
            (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            file_path: download_dir.join(&metainfo.info.name),
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::MalformedTorrent(format!(
                "piece index {} out of bounds",
                index
            )))
        }
    }

    /// Returns the offset of the piece in the output file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

/// Builds a [`StorageInfo`] for a file in the temp directory, deriving the
/// piece geometry from the piece length and download length.
#[cfg(test)]
pub(crate) fn test_storage(
    piece_len: u32,
    download_len: u64,
    file_name: &str,
) -> StorageInfo {
    let piece_count =
        ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
    let last_piece_len = if piece_count == 0 {
        0
    } else {
        (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32
    };
    StorageInfo {
        piece_count,
        piece_len,
        last_piece_len,
        download_len,
        file_path: std::env::temp_dir().join(file_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_len() {
        // 3 full length pieces and 1 smaller piece
        let info = test_storage(4, 3 * 4 + 2, "bogus");
        assert_eq!(info.piece_count, 4);
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(1).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 4);
        assert_eq!(info.piece_len(3).unwrap(), 2);
        assert!(info.piece_len(4).is_err());
    }

    #[test]
    fn test_piece_len_exact_multiple() {
        let info = test_storage(4, 2 * 4, "bogus");
        assert_eq!(info.piece_count, 2);
        assert_eq!(info.last_piece_len, 4);
        assert_eq!(info.piece_len(1).unwrap(), 4);
    }

    #[test]
    fn test_piece_offset() {
        let info = test_storage(4, 10, "bogus");
        assert_eq!(info.piece_offset(0), 0);
        assert_eq!(info.piece_offset(2), 8);
    }
}
