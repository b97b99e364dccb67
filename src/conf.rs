//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// All client ids generated by this crate start with this prefix, in the
/// Azureus style: a fixed client tag followed by 12 random decimal digits.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-PC1000-";

/// The configuration of a torrent download.
///
/// All tunables of the engine live here with reasonable defaults, except for
/// the download directory, as it is not sensible to guess that for the user.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The ID of the client to announce to the tracker and to send to peers in
    /// the handshake. Freshly generated for every configuration; a client id
    /// is not stable across runs.
    pub client_id: PeerId,

    /// The directory in which the downloaded file is placed.
    pub download_dir: PathBuf,

    /// The TCP port reported to the tracker. We don't accept inbound
    /// connections (this is a leech-only engine), but trackers require the
    /// field.
    pub listen_port: u16,

    /// The number of peer connection tasks the torrent keeps running.
    pub max_peer_connection_count: usize,

    /// The announce interval used until the first tracker response overrides
    /// it.
    pub announce_interval: Duration,

    /// An outstanding block request older than this is considered lost and is
    /// handed out again to the next peer that asks for work.
    pub max_pending_time: Duration,
}

impl Conf {
    /// Returns the configuration with the defaults above and a freshly
    /// generated client id.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_id: generate_client_id(),
            download_dir: download_dir.into(),
            listen_port: 6889,
            max_peer_connection_count: 40,
            announce_interval: Duration::from_secs(30 * 60),
            max_pending_time: Duration::from_secs(5 * 60),
        }
    }
}

/// Generates an Azureus style client id: [`CLIENT_ID_PREFIX`] followed by 12
/// random decimal digits.
pub(crate) fn generate_client_id() -> PeerId {
    let mut id = [0; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[CLIENT_ID_PREFIX.len()..].iter_mut() {
        *b = b'0' + rng.gen_range(0u8..10);
    }
    id
}
