//! Parsing and validation of the `.torrent` metainfo file.
//!
//! Only single file torrents are supported: a metainfo that contains the
//! `info.files` key is rejected as malformed.

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    PieceIndex, Sha1Hash,
};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
}

impl Metainfo {
    /// Parses a metainfo file from its raw bencoded bytes and validates it.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Self = serde_bencode::from_bytes(buf)?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    /// Computes the torrent's info hash: the SHA-1 digest of the bencoded
    /// `info` dictionary, re-encoded from the parsed representation.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The total download size, in bytes.
    pub fn total_size(&self) -> u64 {
        // `validate` has established that the length field is present
        self.info.length.unwrap_or(0)
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the expected SHA-1 digest of the piece at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub(crate) fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[index * 20..index * 20 + 20]);
        hash
    }

    /// Returns the per piece SHA-1 digests, in piece order.
    pub(crate) fn piece_hashes(&self) -> Vec<Sha1Hash> {
        (0..self.piece_count()).map(|i| self.piece_hash(i)).collect()
    }

    fn validate(&self) -> Result<()> {
        if self.info.files.is_some() {
            return Err(Error::MalformedTorrent(
                "multi-file torrents are not supported".into(),
            ));
        }
        let total_size = match self.info.length {
            Some(len) => len,
            None => {
                return Err(Error::MalformedTorrent(
                    "missing file length".into(),
                ))
            }
        };
        if self.info.piece_length == 0 {
            return Err(Error::MalformedTorrent("piece length is zero".into()));
        }
        if self.info.pieces.len() % 20 != 0 {
            return Err(Error::MalformedTorrent(
                "piece hashes are not a multiple of 20 bytes".into(),
            ));
        }
        // all pieces but the last must be fully covered by the download and
        // the last piece must not be empty
        let piece_count = self.piece_count() as u64;
        let piece_length = self.info.piece_length;
        if total_size > piece_count * piece_length
            || (piece_count > 0 && total_size <= (piece_count - 1) * piece_length)
        {
            return Err(Error::MalformedTorrent(
                "download size does not match the piece count".into(),
            ));
        }
        if piece_count == 0 && total_size > 0 {
            return Err(Error::MalformedTorrent(
                "no piece hashes for a non-empty download".into(),
            ));
        }
        Ok(())
    }
}

/// The `info` dictionary of the metainfo file.
///
/// Fields are declared in bencode sorted key order so that serializing the
/// parsed value reproduces the canonical encoding whose SHA-1 digest is the
/// info hash.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub pieces: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

/// An entry of a multi-file torrent. Parsed only so that its presence can be
/// rejected.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub length: i64,
    pub path: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // Builds the raw bencoding of a single file torrent by hand so the tests
    // don't depend on our own serializer.
    fn raw_torrent(piece_length: u64, length: u64, pieces: &[u8]) -> Vec<u8> {
        let mut info = Vec::new();
        info.extend_from_slice(format!("d6:lengthi{}e", length).as_bytes());
        info.extend_from_slice(b"4:name10:output.bin");
        info.extend_from_slice(
            format!("12:piece lengthi{}e", piece_length).as_bytes(),
        );
        info.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        info.extend_from_slice(pieces);
        info.push(b'e');

        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce31:http://tracker.example/announce");
        buf.extend_from_slice(b"4:info");
        buf.extend_from_slice(&info);
        buf.push(b'e');
        buf
    }

    // Returns just the bencoded `info` dictionary of the above.
    fn raw_info(buf: &[u8]) -> &[u8] {
        let start = b"d8:announce31:http://tracker.example/announce4:info".len();
        &buf[start..buf.len() - 1]
    }

    #[test]
    fn test_parse_single_file_torrent() {
        let pieces = [0xab; 40];
        let buf = raw_torrent(16384, 16394, &pieces);

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.announce, "http://tracker.example/announce");
        assert_eq!(metainfo.info.name, "output.bin");
        assert_eq!(metainfo.info.piece_length, 16384);
        assert_eq!(metainfo.total_size(), 16394);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_hash(0), [0xab; 20]);
        assert_eq!(metainfo.piece_hashes().len(), 2);
    }

    #[test]
    fn test_info_hash_is_digest_of_raw_info() {
        let pieces = [0xcd; 20];
        let buf = raw_torrent(16384, 10, &pieces);

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let info_hash = metainfo.create_info_hash().unwrap();

        let mut expected = [0; 20];
        expected.copy_from_slice(&Sha1::digest(raw_info(&buf)));
        assert_eq!(info_hash, expected);
    }

    #[test]
    fn test_multi_file_torrent_is_rejected() {
        let buf = b"d8:announce31:http://tracker.example/announce\
            4:infod5:filesld6:lengthi5e4:pathl1:aeee\
            4:name10:output.bin12:piece lengthi16384e6:pieces20:\
            aaaaaaaaaaaaaaaaaaaae"
            .to_vec();
        match Metainfo::from_bytes(&buf) {
            Err(Error::MalformedTorrent(_)) => {}
            other => panic!("expected MalformedTorrent, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_piece_hashes_are_rejected() {
        let pieces = [0xab; 19];
        let buf = raw_torrent(16384, 10, &pieces);
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::MalformedTorrent(_))
        ));
    }

    #[test]
    fn test_size_piece_count_mismatch_is_rejected() {
        // one piece hash cannot cover two pieces worth of bytes
        let pieces = [0xab; 20];
        let buf = raw_torrent(16384, 2 * 16384, &pieces);
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::MalformedTorrent(_))
        ));
    }
}
