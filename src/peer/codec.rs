//! The BitTorrent wire protocol: the initial handshake frame and the
//! length-prefixed peer message frames exchanged afterwards.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, HandshakeError, Result},
    pack_bitfield, unpack_bitfield, Bitfield, BlockInfo, PeerId, PieceIndex,
    Sha1Hash,
};

/// The fixed 20 byte ASCII protocol identifier BEP-3 mandates.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed size, in bytes, of a handshake frame on the wire.
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Bit signaling support for the non-standard `do-not-have` (id 10)
/// extension, set in the last reserved byte of the handshake. Peers that
/// don't set it should never be sent that message.
pub(crate) const DO_NOT_HAVE_BIT: u8 = 0x01;

/// The initial message exchanged by both sides of a peer connection, before
/// any other message may be sent.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[7] |= DO_NOT_HAVE_BIT;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }
}

/// Frames a single, fixed-size 68 byte handshake. Used only for the first
/// message exchanged on a new connection; the socket is switched to
/// [`PeerCodec`] immediately after.
pub(crate) struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HANDSHAKE_LEN {
            src.reserve(HANDSHAKE_LEN - src.len());
            return Ok(None);
        }

        let prot_len = src[0] as usize;
        if prot_len != 19 {
            return Err(HandshakeError::InvalidProtocol.into());
        }

        let mut prot = [0; 19];
        prot.copy_from_slice(&src[1..20]);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(HandshakeError::InvalidProtocol.into());
        }

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&src[20..28]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&src[28..48]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&src[48..68]);

        src.advance(HANDSHAKE_LEN);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(19);
        dst.extend_from_slice(&item.prot);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        Ok(())
    }
}

/// The numeric identifier of a peer message, as it appears on the wire
/// directly after the 4 byte length prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
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
    Port = 9,
    /// A non-standard extension: tells a peer we cannot serve a piece it
    /// requested (e.g. the on-disk copy failed verification), rather than
    /// silently dropping the request.
    DoNotHave = 10,
}

impl std::convert::TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            10 => Self::DoNotHave,
            other => {
                return Err(Error::MalformedMessage(format!(
                    "unknown message id {}",
                    other
                )))
            }
        })
    }
}

/// A single peer wire message, already parsed out of its length-prefixed
/// frame.
#[derive(Clone, Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port(u16),
    DoNotHave { index: PieceIndex },
}

impl Message {
    /// Returns the message's wire id, or `None` for the length-0 keep alive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
            Self::DoNotHave { .. } => Some(MessageId::DoNotHave),
        }
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Frames the length-prefixed peer messages exchanged after the handshake:
/// a 4 byte big endian length, followed (unless the length is 0, a keep
/// alive) by a 1 byte id and the id-specific payload.
pub(crate) struct PeerCodec {
    /// The number of pieces in the torrent, needed to trim the padding bits
    /// off an incoming bitfield's wire representation.
    pub piece_count: usize,
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = read_u32(&src[..4]) as usize;
        if len == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        let id = MessageId::try_from(src[4])?;
        let payload = src[5..4 + len].to_vec();
        src.advance(4 + len);

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload.len() != 4 {
                    return Err(Error::MalformedMessage(
                        "have payload must be 4 bytes".into(),
                    ));
                }
                Message::Have {
                    index: read_u32(&payload) as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                Message::Bitfield(unpack_bitfield(&payload, self.piece_count))
            }
            MessageId::Request => {
                Message::Request(decode_block_info(&payload)?)
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(Error::MalformedMessage(
                        "piece payload too short".into(),
                    ));
                }
                Message::Block {
                    piece_index: read_u32(&payload[0..4]) as PieceIndex,
                    offset: read_u32(&payload[4..8]),
                    data: payload[8..].to_vec(),
                }
            }
            MessageId::Cancel => Message::Cancel(decode_block_info(&payload)?),
            MessageId::Port => {
                if payload.len() != 2 {
                    return Err(Error::MalformedMessage(
                        "port payload must be 2 bytes".into(),
                    ));
                }
                Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
            MessageId::DoNotHave => {
                if payload.len() != 4 {
                    return Err(Error::MalformedMessage(
                        "do-not-have payload must be 4 bytes".into(),
                    ));
                }
                Message::DoNotHave {
                    index: read_u32(&payload) as PieceIndex,
                }
            }
        };

        Ok(Some(msg))
    }
}

fn decode_block_info(payload: &[u8]) -> Result<BlockInfo> {
    if payload.len() != 12 {
        return Err(Error::MalformedMessage(
            "request/cancel payload must be 12 bytes".into(),
        ));
    }
    Ok(BlockInfo {
        piece_index: read_u32(&payload[0..4]) as PieceIndex,
        offset: read_u32(&payload[4..8]),
        len: read_u32(&payload[8..12]),
    })
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        match item {
            Message::KeepAlive => {
                dst.put_u32(0);
            }
            Message::Choke => encode_id_only(MessageId::Choke, dst),
            Message::Unchoke => encode_id_only(MessageId::Unchoke, dst),
            Message::Interested => encode_id_only(MessageId::Interested, dst),
            Message::NotInterested => {
                encode_id_only(MessageId::NotInterested, dst)
            }
            Message::Have { index } => {
                dst.put_u32(5);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = pack_bitfield(&bitfield);
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.extend_from_slice(&bytes);
            }
            Message::Request(block) => encode_block_info(
                MessageId::Request,
                &block,
                dst,
            ),
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                encode_block_info(MessageId::Cancel, &block, dst)
            }
            Message::Port(port) => {
                dst.put_u32(3);
                dst.put_u8(MessageId::Port as u8);
                dst.put_u16(port);
            }
            Message::DoNotHave { index } => {
                dst.put_u32(5);
                dst.put_u8(MessageId::DoNotHave as u8);
                dst.put_u32(index as u32);
            }
        }
        Ok(())
    }
}

fn encode_id_only(id: MessageId, dst: &mut BytesMut) {
    dst.put_u32(1);
    dst.put_u8(id as u8);
}

fn encode_block_info(id: MessageId, block: &BlockInfo, dst: &mut BytesMut) {
    dst.put_u32(13);
    dst.put_u8(id as u8);
    dst.put_u32(block.piece_index as u32);
    dst.put_u32(block.offset);
    dst.put_u32(block.len);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::BitVec;

    #[test]
    fn handshake_round_trips() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        codec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [1; 20]);
        assert_eq!(decoded.peer_id, [2; 20]);
    }

    #[test]
    fn rejects_bad_protocol_string() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.extend_from_slice(b"not the protocol!!!");
        buf.extend_from_slice(&[0; 8 + 20 + 20]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn request_round_trips() {
        let mut codec = PeerCodec { piece_count: 10 };
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        codec.encode(Message::Request(block), &mut buf).unwrap();
        match codec.decode(&mut buf).unwrap().unwrap() {
            Message::Request(decoded) => assert_eq!(decoded, block),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn bitfield_round_trips_with_padding() {
        let mut codec = PeerCodec { piece_count: 10 };
        let mut bitfield: Bitfield = BitVec::repeat(false, 10);
        bitfield.set(0, true);
        bitfield.set(9, true);
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Bitfield(bitfield.clone()), &mut buf)
            .unwrap();
        match codec.decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(decoded) => assert_eq!(decoded, bitfield),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn keep_alive_has_zero_length_prefix() {
        let mut codec = PeerCodec { piece_count: 1 };
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..4], &0u32.to_be_bytes());
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::KeepAlive)
        ));
    }

    #[test]
    fn unknown_id_is_malformed() {
        let mut codec = PeerCodec { piece_count: 1 };
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::MalformedMessage(_))
        ));
    }
}
