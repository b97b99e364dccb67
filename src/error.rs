//! The error type shared by all parts of the engine.

use std::{fmt, io};

pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by the torrent engine.
///
/// Only failures that concern the whole torrent are surfaced to the caller of
/// [`crate::torrent::Torrent::start`]; everything that concerns a single peer
/// or a single piece is recovered internally and at most logged.
#[derive(Debug)]
pub enum Error {
    /// The metainfo file is not valid bencode.
    Bencode(serde_bencode::Error),
    /// The metainfo file parsed but describes a torrent we cannot download
    /// (multi-file, truncated piece hashes, inconsistent sizes). Fatal.
    MalformedTorrent(String),
    /// The tracker could not be reached, returned a non-200 status, or its
    /// response contained a failure reason or was not decodable.
    Tracker(String),
    /// The tracker returned the dictionary model peer list, which is not
    /// supported; only the compact binary model is.
    PeerListNotSupported,
    /// The peer did not send a handshake, or closed the connection before
    /// completing it.
    NoHandshake,
    /// The info hash in the peer's handshake does not match ours.
    InvalidPeerInfoHash,
    /// The peer's bitfield is shorter than the torrent's piece count or has
    /// set bits past it.
    InvalidBitfield,
    /// A message frame violated the wire format (wrong payload length for its
    /// message id, invalid handshake protocol string).
    MalformedFrame(String),
    /// Network IO error on a peer connection. Drops that peer only.
    Io(io::Error),
    /// IO error on the output file. Aborts the whole download.
    Disk(io::Error),
    /// The download was stopped via [`crate::torrent::StopHandle`] before
    /// completing.
    Aborted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Bencode(e) => write!(f, "invalid bencoding: {}", e),
            Error::MalformedTorrent(reason) => {
                write!(f, "malformed torrent: {}", reason)
            }
            Error::Tracker(reason) => write!(f, "tracker error: {}", reason),
            Error::PeerListNotSupported => {
                write!(f, "dictionary model peer list is not supported")
            }
            Error::NoHandshake => write!(f, "peer did not send a handshake"),
            Error::InvalidPeerInfoHash => {
                write!(f, "info hash in peer handshake does not match ours")
            }
            Error::InvalidBitfield => {
                write!(f, "peer bitfield does not match the piece count")
            }
            Error::MalformedFrame(reason) => {
                write!(f, "malformed frame: {}", reason)
            }
            Error::Io(e) => write!(f, "peer IO error: {}", e),
            Error::Disk(e) => write!(f, "disk IO error: {}", e),
            Error::Aborted => write!(f, "download aborted"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bencode(e) => Some(e),
            Error::Io(e) | Error::Disk(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}
