//! A peer session is one of the concurrently running peer connection tasks of
//! a torrent. Each session loops taking a peer address off the shared queue,
//! connecting, exchanging handshakes and downloading blocks until the
//! connection drops or the torrent stops, then goes back to the queue for the
//! next peer.

mod codec;

use {
    futures::{
        pin_mut, select,
        stream::{Fuse, SplitSink},
        FutureExt, SinkExt, StreamExt,
    },
    std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        net::TcpStream,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            Mutex,
        },
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        error::{Error, Result},
        piece_manager::PieceManager,
        torrent::PeerQueue,
        Bitfield, PeerId, Sha1Hash,
    },
    codec::*,
};

/// How long we wait for the remote handshake before giving up on the peer.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// The write half of the peer connection, after the codec switch.
type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

pub(crate) struct PeerSession {
    /// The queue of peer addresses shared with all other sessions of the
    /// torrent, refilled by the coordinator from tracker announces.
    queue: Arc<PeerQueue>,
    /// The piece manager, shared with all other sessions.
    piece_manager: Arc<Mutex<PieceManager>>,
    /// The torrent's info hash, sent in our handshake and verified against
    /// the peer's.
    info_hash: Sha1Hash,
    /// Our own id, sent in our handshake.
    client_id: PeerId,
    /// The number of pieces in the torrent, for validating bitfields.
    piece_count: usize,
    /// Set when the torrent is shutting down; also set by a session that hits
    /// a disk error, as that concerns the whole torrent.
    abort: Arc<AtomicBool>,
    /// The port on which the session receives commands from the coordinator.
    cmd_port: Fuse<Receiver>,
    /// The current state of the session.
    state: State,
    /// The choke and interest state of both sides of the connection.
    status: Status,
    /// Whether we have a block request outstanding on this connection. The
    /// pipeline is one deep: at most one request is in flight per peer.
    request_in_flight: bool,
    /// The id the remote end sent in its handshake. Set per connection.
    peer_id: Option<PeerId>,
}

impl PeerSession {
    /// Creates a new session feeding off the given peer queue and returns it
    /// together with its command channel.
    pub fn new(
        queue: Arc<PeerQueue>,
        piece_manager: Arc<Mutex<PieceManager>>,
        info_hash: Sha1Hash,
        client_id: PeerId,
        piece_count: usize,
        abort: Arc<AtomicBool>,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                queue,
                piece_manager,
                info_hash,
                client_id,
                piece_count,
                abort,
                cmd_port: cmd_port.fuse(),
                state: State::default(),
                status: Status::default(),
                request_in_flight: false,
                peer_id: None,
            },
            cmd_chan,
        )
    }

    /// Runs the session until the torrent is shut down: waits for a peer
    /// address, downloads from that peer for as long as the connection lasts
    /// and moves on to the next address.
    ///
    /// Anything that concerns only the current peer (refused connections,
    /// protocol violations, resets) is logged and the session moves on; only
    /// a disk error is returned, after flagging the whole torrent for
    /// shutdown.
    pub async fn start(&mut self) -> Result<()> {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                break;
            }

            let queue = Arc::clone(&self.queue);
            let pop = queue.pop().fuse();
            pin_mut!(pop);
            let addr = select! {
                addr = pop => addr,
                cmd = self.cmd_port.select_next_some() => match cmd {
                    Command::Shutdown => break,
                },
            };

            log::info!("Peer task assigned to {}", addr);
            match self.run_session(addr).await {
                Ok(()) => log::info!("Peer {} session ended", addr),
                Err(e @ Error::Disk(_)) => {
                    log::error!("Peer {} session aborted: {}", addr, e);
                    self.abort.store(true, Ordering::SeqCst);
                    return Err(e);
                }
                Err(Error::Io(e)) => {
                    log::warn!("Unable to talk to peer {}: {}", addr, e)
                }
                Err(e) => {
                    log::warn!("Protocol error with peer {}: {}", addr, e)
                }
            }
        }
        Ok(())
    }

    /// Connects to the peer, exchanges handshakes and runs the message loop
    /// over a single connection.
    async fn run_session(&mut self, addr: SocketAddr) -> Result<()> {
        log::info!("Connecting to peer {}", addr);
        self.state = State::Connecting;
        let socket = TcpStream::connect(addr).await?;
        log::info!("Connected to peer {}", addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.state = State::Handshaking;
        let handshake = Handshake::new(self.info_hash, self.client_id);
        log::info!("Sending handshake to peer {}", addr);
        socket.send(handshake).await?;

        // receive peer's handshake
        log::info!("Waiting for peer {} handshake", addr);
        let peer_handshake =
            match time::timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
                Ok(Some(handshake)) => handshake?,
                Ok(None) => return Err(Error::NoHandshake),
                Err(_) => {
                    log::warn!("Peer {} handshake timed out", addr);
                    return Err(Error::NoHandshake);
                }
            };
        log::debug!("Peer {} handshake: {:?}", addr, peer_handshake);
        // codec should only return handshake if the protocol string in it
        // is valid
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.info_hash {
            log::warn!("Peer {} handshake invalid info hash", addr);
            return Err(Error::InvalidPeerInfoHash);
        }

        // The compact tracker peer list carries no peer ids, so there is
        // nothing to check the received id against; it becomes the peer's
        // identity for the availability map.
        let peer_id = peer_handshake.peer_id;
        self.peer_id = Some(peer_id);

        // now that we have the handshake, we need to switch to the peer
        // message codec (note that we need to keep the buffer from the
        // original codec as it may contain bytes of any potential message the
        // peer may have sent after the handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        // register the peer before any of its messages are processed so that
        // have updates count even if it never sends a bitfield
        self.piece_manager
            .lock()
            .await
            .add_peer(peer_id, Bitfield::repeat(false, self.piece_count));

        self.state = State::Connected;
        log::info!("Peer {} session state: {:?}", addr, self.state);

        let res = self.run(addr, socket).await;

        // per connection cleanup, on the error paths too
        self.piece_manager.lock().await.remove_peer(&peer_id);
        self.peer_id = None;
        self.status = Status::default();
        self.request_in_flight = false;
        self.state = State::Disconnected;

        res
    }

    /// Runs the session's message loop after the connection to the peer is
    /// established.
    async fn run(
        &mut self,
        addr: SocketAddr,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        // split the sink and stream so that we can pass the sink while
        // holding a reference to the stream in the loop
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // we start out choked and immediately declare interest
        log::info!("Interested in peer {}", addr);
        sink.send(Message::Interested).await?;
        self.status.is_interested = true;

        loop {
            select! {
                msg = stream.next() => match msg {
                    Some(msg) => {
                        let msg = msg?;
                        log::debug!(
                            "Received message {:?} from peer {}",
                            msg.id(),
                            addr
                        );
                        self.handle_msg(addr, &mut sink, msg).await?;
                    }
                    None => {
                        log::info!("Peer {} closed the connection", addr);
                        break;
                    }
                },
                cmd = self.cmd_port.select_next_some() => match cmd {
                    Command::Shutdown => {
                        log::info!("Shutting down peer {} session", addr);
                        break;
                    }
                },
            }

            if self.abort.load(Ordering::SeqCst) {
                break;
            }
        }

        Ok(())
    }

    /// Handles a single message and, if the connection allows it, puts the
    /// next block request on the wire.
    async fn handle_msg(
        &mut self,
        addr: SocketAddr,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", addr);
            }
            Message::Bitfield(bitfield) => {
                self.handle_bitfield_msg(addr, bitfield).await?;
            }
            Message::Have { piece_index } => {
                if let Some(peer_id) = self.peer_id {
                    self.piece_manager
                        .lock()
                        .await
                        .update_peer(&peer_id, piece_index);
                }
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", addr);
                    self.status.is_choked = true;
                    // a request outstanding at the time of the choke will not
                    // be served anymore
                    self.request_in_flight = false;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", addr);
                    self.status.is_choked = false;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.request_in_flight = false;
                if let Some(peer_id) = self.peer_id {
                    self.piece_manager
                        .lock()
                        .await
                        .block_received(&peer_id, piece_index, offset, data)?;
                }
            }
            // valid messages, but we don't serve blocks
            Message::Request(block) => {
                log::info!(
                    "Peer {} requested block {:?}, ignoring: seeding is not \
                     supported",
                    addr,
                    block
                );
            }
            Message::Cancel(block) => {
                log::info!(
                    "Peer {} cancelled block {:?}, ignoring: seeding is not \
                     supported",
                    addr,
                    block
                );
            }
        }

        // every handled message is a chance to put a new request on the wire
        self.make_request(addr, sink).await
    }

    /// Installs the peer's bitfield into the piece manager.
    async fn handle_bitfield_msg(
        &mut self,
        addr: SocketAddr,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        log::info!("Handling peer {} bitfield message", addr);
        log::trace!("Bitfield: {:?}", bitfield);

        // The bitfield raw data that is sent over the wire may be longer than
        // the pieces it represents, if the number of pieces in torrent is not
        // a multiple of 8; the excess bits must all be zero.
        if bitfield.len() < self.piece_count
            || bitfield[self.piece_count..].any()
        {
            log::warn!("Peer {} sent an invalid bitfield", addr);
            return Err(Error::InvalidBitfield);
        }
        bitfield.resize(self.piece_count, false);

        if let Some(peer_id) = self.peer_id {
            self.piece_manager.lock().await.add_peer(peer_id, bitfield);
        }
        Ok(())
    }

    /// Asks the piece manager for the next block for this peer and requests
    /// it, if the peer lets us download and no request is in flight yet.
    async fn make_request(
        &mut self,
        addr: SocketAddr,
        sink: &mut MessageSink,
    ) -> Result<()> {
        if self.status.is_choked
            || !self.status.is_interested
            || self.request_in_flight
        {
            return Ok(());
        }
        let peer_id = match self.peer_id {
            Some(peer_id) => peer_id,
            None => return Ok(()),
        };

        let block = self.piece_manager.lock().await.next_request(&peer_id);
        if let Some(block) = block {
            log::debug!("Requesting block {:?} from peer {}", block, addr);
            self.request_in_flight = true;
            // send also flushes
            sink.send(Message::Request(block)).await?;
        }
        Ok(())
    }
}

/// The channel on which the torrent can send a command to the peer session
/// task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
#[derive(Debug)]
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the handshake, may be exchanged.
    Connected,
}

/// The default (and initial) state of a peer session is `Disconnected`.
impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}
