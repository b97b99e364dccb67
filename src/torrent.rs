//! The download coordinator: owns the piece manager and the peer connection
//! tasks, and refills the shared peer address queue from periodic tracker
//! announces until the download completes or is aborted.

use {
    std::{
        collections::VecDeque,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        time::{Duration, Instant},
    },
    tokio::{
        sync::{Mutex as AsyncMutex, Semaphore},
        task, time,
    },
};

use crate::{
    conf::Conf,
    error::{Error, Result},
    metainfo::Metainfo,
    peer::{self, Command, PeerSession},
    piece_manager::PieceManager,
    storage_info::StorageInfo,
    tracker::{Event, Tracker},
    Sha1Hash,
};

/// How long the announce loop sleeps between checks when no announce is due.
const ANNOUNCE_TICK: Duration = Duration::from_secs(5);

/// The queue of peer addresses the coordinator received from the tracker and
/// the peer sessions consume: a FIFO with one producer (the announce loop)
/// and many consumers (the sessions).
///
/// Each announce replaces the queue's contents wholesale, so a session never
/// connects to an address from a stale peer list.
pub(crate) struct PeerQueue {
    addrs: Mutex<VecDeque<SocketAddr>>,
    /// Counts the queued addresses so that consumers can wait for one
    /// without spinning.
    available: Semaphore,
}

impl PeerQueue {
    pub fn new() -> Self {
        Self {
            addrs: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
        }
    }

    /// Waits until an address is available and takes it.
    pub async fn pop(&self) -> SocketAddr {
        loop {
            let permit = self.available.acquire().await;
            permit.forget();
            if let Some(addr) = self.addrs.lock().unwrap().pop_front() {
                return addr;
            }
            // the queue was replaced between the permit and the lock; the
            // permit was stale, wait for a fresh one
        }
    }

    /// Replaces the queue contents with a fresh announce's peer list.
    pub fn replace(&self, new: Vec<SocketAddr>) {
        let mut addrs = self.addrs.lock().unwrap();
        while let Ok(permit) = self.available.try_acquire() {
            permit.forget();
        }
        addrs.clear();
        let count = new.len();
        addrs.extend(new);
        self.available.add_permits(count);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.addrs.lock().unwrap().len()
    }
}

/// A cloneable handle with which the download can be stopped from another
/// task, e.g. on a user signal.
#[derive(Clone)]
pub struct StopHandle {
    abort: Arc<AtomicBool>,
}

impl StopHandle {
    /// Signals the torrent to stop. The announce loop and the peer sessions
    /// exit at their next suspension point.
    pub fn stop(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

/// A peer session task and the channel on which it is told to shut down.
struct PeerHandle {
    cmd_chan: peer::Sender,
    handle: task::JoinHandle<Result<()>>,
}

/// A single torrent download.
pub struct Torrent {
    conf: Conf,
    info_hash: Sha1Hash,
    piece_count: usize,
    tracker: Tracker,
    queue: Arc<PeerQueue>,
    piece_manager: Arc<AsyncMutex<PieceManager>>,
    abort: Arc<AtomicBool>,
    /// The spawned peer session tasks. Populated by `start`.
    peers: Vec<PeerHandle>,
}

impl Torrent {
    /// Sets up the download: creates the output file sized to the download
    /// length and the tracker client. Nothing is contacted yet.
    pub fn new(metainfo: Metainfo, conf: Conf) -> Result<Self> {
        let info_hash = metainfo.create_info_hash()?;
        log::info!(
            "Torrent {} ({}): {} bytes in {} pieces",
            metainfo.info.name,
            hex::encode(&info_hash),
            metainfo.total_size(),
            metainfo.piece_count()
        );

        let storage = StorageInfo::new(&metainfo, conf.download_dir.clone());
        let piece_count = storage.piece_count;
        let piece_hashes = metainfo.piece_hashes();
        let piece_manager =
            PieceManager::new(storage, piece_hashes, conf.max_pending_time)?;
        let tracker = Tracker::new(
            &metainfo.announce,
            info_hash,
            conf.client_id,
            conf.listen_port,
        )?;

        Ok(Self {
            conf,
            info_hash,
            piece_count,
            tracker,
            queue: Arc::new(PeerQueue::new()),
            piece_manager: Arc::new(AsyncMutex::new(piece_manager)),
            abort: Arc::new(AtomicBool::new(false)),
            peers: Vec::new(),
        })
    }

    /// Returns a handle with which this download can be stopped.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            abort: Arc::clone(&self.abort),
        }
    }

    /// Downloads the torrent: spawns the peer sessions and runs the announce
    /// loop until the download completes, the stop handle fires, or a disk
    /// error kills the download. All of the torrent's resources are released
    /// before returning.
    ///
    /// Returns `Ok(())` on completion and [`Error::Aborted`] when stopped
    /// early.
    pub async fn start(&mut self) -> Result<()> {
        log::info!(
            "Starting {} peer connections",
            self.conf.max_peer_connection_count
        );
        for _ in 0..self.conf.max_peer_connection_count {
            let (mut session, cmd_chan) = PeerSession::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.piece_manager),
                self.info_hash,
                self.conf.client_id,
                self.piece_count,
                Arc::clone(&self.abort),
            );
            let handle = task::spawn(async move { session.start().await });
            self.peers.push(PeerHandle { cmd_chan, handle });
        }

        let run_result = self.announce_loop().await;
        match self.stop().await {
            Err(e) => Err(e),
            Ok(()) => run_result,
        }
    }

    /// Announces to the tracker whenever the current interval has passed,
    /// replacing the peer queue with each response's peer list, until the
    /// piece manager reports completion or the abort flag is set.
    async fn announce_loop(&mut self) -> Result<()> {
        let mut last_announce: Option<Instant> = None;
        let mut interval = self.conf.announce_interval;

        loop {
            if self.piece_manager.lock().await.is_complete() {
                log::info!("Download complete");
                return Ok(());
            }
            if self.abort.load(Ordering::SeqCst) {
                log::info!("Download aborted");
                return Err(Error::Aborted);
            }

            let is_due =
                last_announce.map_or(true, |at| at.elapsed() >= interval);
            if is_due {
                let (downloaded, uploaded) = {
                    let piece_manager = self.piece_manager.lock().await;
                    (
                        piece_manager.bytes_downloaded(),
                        piece_manager.bytes_uploaded(),
                    )
                };
                let event = if last_announce.is_none() {
                    Some(Event::Started)
                } else {
                    None
                };

                match self.tracker.announce(downloaded, uploaded, event).await
                {
                    Ok(response) => {
                        log::info!(
                            "Tracker returned {} peers, next announce in {:?}",
                            response.peers.len(),
                            response.interval
                        );
                        interval = response.interval;
                        self.queue.replace(response.peers);
                    }
                    // not fatal, retry at the next interval
                    Err(e) => log::warn!("Announce failed: {}", e),
                }
                last_announce = Some(Instant::now());
            } else {
                time::delay_for(ANNOUNCE_TICK).await;
            }
        }
    }

    /// Stops every peer session, waits for them to exit and closes the piece
    /// manager.
    async fn stop(&mut self) -> Result<()> {
        log::info!("Stopping torrent");
        self.abort.store(true, Ordering::SeqCst);
        for peer in self.peers.iter() {
            // a session that already exited has dropped its receiver
            let _ = peer.cmd_chan.send(Command::Shutdown);
        }

        let mut session_error = None;
        for peer in self.peers.drain(..) {
            match peer.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("Peer session failed: {}", e);
                    if session_error.is_none() {
                        session_error = Some(e);
                    }
                }
                Err(e) => log::warn!("Peer task panicked: {}", e),
            }
        }

        self.piece_manager.lock().await.close()?;
        match session_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{mock, Matcher};
    use pretty_assertions::assert_eq;
    use sha1::{Digest, Sha1};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    #[tokio::test]
    async fn test_peer_queue_replace_discards_old_addresses() {
        let queue = PeerQueue::new();
        let stale: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let fresh: SocketAddr = "10.0.0.2:6881".parse().unwrap();

        queue.replace(vec![stale, stale]);
        queue.replace(vec![fresh]);

        assert_eq!(queue.pop().await, fresh);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_peer_queue_pop_waits_for_replace() {
        let queue = Arc::new(PeerQueue::new());
        let addr: SocketAddr = "10.0.0.3:6881".parse().unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        // give the consumer a chance to block on the empty queue
        time::delay_for(Duration::from_millis(20)).await;
        queue.replace(vec![addr]);

        assert_eq!(consumer.await.unwrap(), addr);
    }

    fn digest(data: &[u8]) -> [u8; 20] {
        let mut hash = [0; 20];
        hash.copy_from_slice(&Sha1::digest(data));
        hash
    }

    // Builds the raw metainfo of a single piece, 10 byte torrent whose
    // content is "helloworld".
    fn helloworld_metainfo(announce: &str, name: &str) -> Metainfo {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            format!("d8:announce{}:{}", announce.len(), announce).as_bytes(),
        );
        buf.extend_from_slice(b"4:infod6:lengthi10e");
        buf.extend_from_slice(format!("4:name{}:{}", name.len(), name).as_bytes());
        buf.extend_from_slice(b"12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&digest(b"helloworld"));
        buf.extend_from_slice(b"ee");
        Metainfo::from_bytes(&buf).unwrap()
    }

    fn compact_announce_body(interval: u64, addr: SocketAddr) -> Vec<u8> {
        let mut body =
            format!("d8:intervali{}e5:peers6:", interval).into_bytes();
        match addr {
            SocketAddr::V4(addr) => {
                body.extend_from_slice(&addr.ip().octets());
                body.extend_from_slice(&addr.port().to_be_bytes());
            }
            SocketAddr::V6(_) => unreachable!(),
        }
        body.push(b'e');
        body
    }

    // The whole engine against a stub tracker and a stub seed: announce,
    // connect, download the single piece, complete.
    #[tokio::test]
    async fn test_download_via_stub_tracker_and_seed() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed_addr = listener.local_addr().unwrap();

        let seed = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut handshake = [0u8; 68];
            socket.read_exact(&mut handshake).await.unwrap();
            // mirror the handshake back with our own id
            handshake[48..68].copy_from_slice(&[0x77; 20]);
            socket.write_all(&handshake).await.unwrap();

            // bitfield with the only piece, unchoke
            socket.write_all(&[0, 0, 0, 2, 5, 0x80]).await.unwrap();
            socket.write_all(&[0, 0, 0, 1, 1]).await.unwrap();

            // interested, then the request
            let mut interested = [0u8; 5];
            socket.read_exact(&mut interested).await.unwrap();
            let mut request = [0u8; 17];
            socket.read_exact(&mut request).await.unwrap();

            let mut block = vec![0, 0, 0, 19, 7];
            block.extend_from_slice(&[0; 8]);
            block.extend_from_slice(b"helloworld");
            socket.write_all(&block).await.unwrap();
        });

        let _m = mock("GET", "/announce")
            .match_query(Matcher::Any)
            .with_body(compact_announce_body(1800, seed_addr))
            .create();

        let announce = format!("{}/announce", mockito::server_url());
        let name = format!(
            "leechtorrent-torrent-{}-stub-download",
            std::process::id()
        );
        let metainfo = helloworld_metainfo(&announce, &name);
        let mut conf = Conf::new(std::env::temp_dir());
        // a couple of connections are plenty against a single stub seed
        conf.max_peer_connection_count = 2;
        let output = conf.download_dir.join(&name);

        let mut torrent = Torrent::new(metainfo, conf).unwrap();
        torrent.start().await.unwrap();
        seed.await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"helloworld");
    }

    // The stop handle must end a download whose tracker never delivers a
    // peer, with the aborted error.
    #[tokio::test]
    async fn test_stop_handle_aborts_download() {
        let name = format!(
            "leechtorrent-torrent-{}-stub-abort",
            std::process::id()
        );
        // nothing is listening on this address, every announce fails
        let metainfo = helloworld_metainfo("http://127.0.0.1:1/announce", &name);
        let mut conf = Conf::new(std::env::temp_dir());
        conf.max_peer_connection_count = 2;

        let mut torrent = Torrent::new(metainfo, conf).unwrap();
        let stop_handle = torrent.stop_handle();
        tokio::spawn(async move {
            time::delay_for(Duration::from_millis(100)).await;
            stop_handle.stop();
        });

        match torrent.start().await {
            Err(Error::Aborted) => {}
            other => panic!("expected Aborted, got {:?}", other),
        }
    }
}
