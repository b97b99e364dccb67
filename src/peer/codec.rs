//! The two codecs of the peer wire protocol: the fixed 68 byte handshake
//! frame and the length prefixed peer messages exchanged after it.

use {
    bytes::{Buf, BufMut, BytesMut},
    std::convert::TryFrom,
    tokio_util::codec::{Decoder, Encoder},
};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol string of the BitTorrent V1 handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake is the first message sent on a new connection, from both
/// sides, outside the regular message framing:
/// `<pstrlen=19><pstr><reserved:8><info_hash:20><peer_id:20>`, 68 bytes in
/// total.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved for extensions, all zeros as we support none.
    pub reserved: [u8; 8],
    /// The torrent's info hash.
    pub info_hash: Sha1Hash,
    /// The sending side's arbitrary peer id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates the handshake we send, with the protocol string filled in.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        dst.reserve(68);
        dst.put_u8(prot.len() as u8);
        dst.extend_from_slice(&prot);
        dst.extend_from_slice(&reserved);
        dst.extend_from_slice(&info_hash);
        dst.extend_from_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        if src.is_empty() {
            return Ok(None);
        }

        // the protocol string length can be checked before the rest of the
        // frame has arrived
        let prot_len = src[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::MalformedFrame(format!(
                "invalid handshake protocol string length {}",
                prot_len
            )));
        }

        let payload_len = prot_len + 8 + 20 + 20;
        if src.remaining() < 1 + payload_len {
            return Ok(None);
        }
        src.advance(1);

        let mut prot = [0; 19];
        src.copy_to_slice(&mut prot);
        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// A peer message after the handshake, framed as
/// `<len:u32><id:u8><payload>`; a zero length frame is a keep alive.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    /// The message carrying a retrieved block. Called "piece" on the wire
    /// even though it transfers a single block of a piece.
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the message's wire id, or `None` for a keep alive, which has
    /// no id.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Block { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(id: u8) -> std::result::Result<Self, Self::Error> {
        match id {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            id => Err(id),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let data = bitfield.into_vec();
                dst.put_u32(1 + data.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.extend_from_slice(&data);
            }
            Message::Request(block) => {
                dst.put_u32(1 + 3 * 4);
                dst.put_u8(MessageId::Request as u8);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                dst.put_u32(1 + 2 * 4 + data.len() as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                dst.put_u32(1 + 3 * 4);
                dst.put_u8(MessageId::Cancel as u8);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        // frames with an unknown message id are consumed and skipped rather
        // than aborting the stream, hence the loop
        loop {
            if src.remaining() < 4 {
                return Ok(None);
            }
            let msg_len =
                u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if src.remaining() < 4 + msg_len {
                // not a full frame yet; pre-allocate for the rest of it
                src.reserve(4 + msg_len - src.remaining());
                return Ok(None);
            }
            src.advance(4);

            if msg_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }

            let mut payload = src.split_to(msg_len);
            let id = payload.get_u8();
            let id = match MessageId::try_from(id) {
                Ok(id) => id,
                Err(id) => {
                    log::warn!(
                        "Skipping message with unknown id {} ({} bytes)",
                        id,
                        msg_len
                    );
                    continue;
                }
            };

            let msg = match id {
                MessageId::Choke => {
                    check_payload_len(&payload, 0, id)?;
                    Message::Choke
                }
                MessageId::Unchoke => {
                    check_payload_len(&payload, 0, id)?;
                    Message::Unchoke
                }
                MessageId::Interested => {
                    check_payload_len(&payload, 0, id)?;
                    Message::Interested
                }
                MessageId::NotInterested => {
                    check_payload_len(&payload, 0, id)?;
                    Message::NotInterested
                }
                MessageId::Have => {
                    check_payload_len(&payload, 4, id)?;
                    Message::Have {
                        piece_index: payload.get_u32() as PieceIndex,
                    }
                }
                MessageId::Bitfield => {
                    Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
                }
                MessageId::Request => {
                    check_payload_len(&payload, 12, id)?;
                    Message::Request(BlockInfo {
                        piece_index: payload.get_u32() as PieceIndex,
                        offset: payload.get_u32(),
                        len: payload.get_u32(),
                    })
                }
                MessageId::Piece => {
                    if payload.remaining() < 8 {
                        return Err(Error::MalformedFrame(format!(
                            "payload of {} bytes is too short for a block \
                             message",
                            payload.remaining()
                        )));
                    }
                    let piece_index = payload.get_u32() as PieceIndex;
                    let offset = payload.get_u32();
                    Message::Block {
                        piece_index,
                        offset,
                        data: payload.to_vec(),
                    }
                }
                MessageId::Cancel => {
                    check_payload_len(&payload, 12, id)?;
                    Message::Cancel(BlockInfo {
                        piece_index: payload.get_u32() as PieceIndex,
                        offset: payload.get_u32(),
                        len: payload.get_u32(),
                    })
                }
            };
            return Ok(Some(msg));
        }
    }
}

/// All messages except bitfield and block have a fixed payload size, which
/// the advertised frame length must match exactly.
fn check_payload_len(
    payload: &BytesMut,
    expected: usize,
    id: MessageId,
) -> Result<()> {
    if payload.remaining() != expected {
        Err(Error::MalformedFrame(format!(
            "invalid payload length {} for message {:?}",
            payload.remaining(),
            id
        )))
    } else {
        Ok(())
    }
}
