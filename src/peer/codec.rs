//! Encoding and decoding of BitTorrent peer protocol frames.
//!
//! Two codecs share the TCP stream over the life of a connection: the
//! fixed-layout [`HandshakeCodec`] for the first 68 bytes in each direction,
//! and the length-prefixed [`PeerCodec`] for everything after. The switch
//! keeps whatever the peer pipelined after its handshake (see the
//! `FramedParts` dance in the session).

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The protocol string of the standard BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Bit 0x10 of reserved byte 5 signals BEP 10 extension protocol support.
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;

/// Nothing legitimate is bigger than a block frame plus headers; anything
/// beyond this cap is a protocol violation and the connection is dropped
/// before the payload is even buffered.
const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// The handshake exchanged once per connection, before any framed message.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// Eight reserved bytes carrying protocol extension flags.
    pub reserved: [u8; 8],
    /// The torrent's info hash; both sides must agree on it.
    pub info_hash: Sha1Hash,
    /// The remote's arbitrary 20 byte identifier.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates our side of the handshake, advertising extension protocol
    /// support.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut reserved = [0; 8];
        reserved[5] |= EXTENSION_PROTOCOL_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the remote speaks the BEP 10 extension protocol.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSION_PROTOCOL_BIT != 0
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .field("extensions", &self.supports_extensions())
            .finish()
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(68);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.len() < 68 {
            return Ok(None);
        }
        if buf[0] != 19 || &buf[1..20] != PROTOCOL_STRING {
            return Err(Error::ProtocolViolation("bad handshake protocol string"));
        }
        buf.advance(20);

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The message id discriminants of BEP 3 plus the BEP 10 extension
/// envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extended = 20,
}

/// A single framed message of the peer protocol.
///
/// Decoding yields exactly one variant per frame and every consumer pattern
/// matches exhaustively; there is no dynamic dispatch over message kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    /// A zero length frame, sent to keep an otherwise silent connection
    /// open.
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
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// A BEP 10 extension frame: the negotiated extension id followed by a
    /// bencoded payload.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// A short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have { .. } => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request(_) => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel(_) => "cancel",
            Message::Extended { .. } => "extended",
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => put_header(buf, MessageId::Choke, 0),
            Message::Unchoke => put_header(buf, MessageId::Unchoke, 0),
            Message::Interested => put_header(buf, MessageId::Interested, 0),
            Message::NotInterested => {
                put_header(buf, MessageId::NotInterested, 0)
            }
            Message::Have { piece_index } => {
                put_header(buf, MessageId::Have, 4);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_raw_slice();
                put_header(buf, MessageId::Bitfield, bytes.len());
                buf.put_slice(bytes);
            }
            Message::Request(block) => {
                put_header(buf, MessageId::Request, 12);
                put_block_info(buf, block);
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                put_header(buf, MessageId::Piece, 8 + data.len());
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                put_header(buf, MessageId::Cancel, 12);
                put_block_info(buf, block);
            }
            Message::Extended { id, payload } => {
                put_header(buf, MessageId::Extended, 1 + payload.len());
                buf.put_u8(id);
                buf.put_slice(&payload);
            }
        }
        Ok(())
    }
}

fn put_header(buf: &mut BytesMut, id: MessageId, payload_len: usize) {
    buf.reserve(4 + 1 + payload_len);
    buf.put_u32(1 + payload_len as u32);
    buf.put_u8(id as u8);
}

fn put_block_info(buf: &mut BytesMut, block: BlockInfo) {
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        // frames with ids we don't recognize are skipped, so decoding loops
        // until it produces a message or runs out of buffered frames
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if frame_len > MAX_FRAME_LEN {
                return Err(Error::ProtocolViolation("frame exceeds sanity cap"));
            }
            if (buf.len() as u64) < 4 + frame_len as u64 {
                // reserve to cut down on reallocations while the rest of the
                // frame trickles in
                buf.reserve(4 + frame_len as usize - buf.len());
                return Ok(None);
            }
            buf.advance(4);

            if frame_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }

            let mut payload = buf.split_to(frame_len as usize);
            let id = payload.get_u8();
            let payload_len = payload.len();

            let msg = match id {
                0 | 1 | 2 | 3 => {
                    if payload_len != 0 {
                        return Err(Error::ProtocolViolation(
                            "flow control message with payload",
                        ));
                    }
                    match id {
                        0 => Message::Choke,
                        1 => Message::Unchoke,
                        2 => Message::Interested,
                        _ => Message::NotInterested,
                    }
                }
                4 => {
                    if payload_len != 4 {
                        return Err(Error::ProtocolViolation("bad have payload"));
                    }
                    Message::Have {
                        piece_index: payload.get_u32() as PieceIndex,
                    }
                }
                5 => Message::Bitfield(Bitfield::from_vec(payload.to_vec())),
                6 | 8 => {
                    if payload_len != 12 {
                        return Err(Error::ProtocolViolation(
                            "bad request payload",
                        ));
                    }
                    let block = BlockInfo {
                        piece_index: payload.get_u32() as PieceIndex,
                        offset: payload.get_u32(),
                        len: payload.get_u32(),
                    };
                    if id == 6 {
                        Message::Request(block)
                    } else {
                        Message::Cancel(block)
                    }
                }
                7 => {
                    if payload_len < 8 {
                        return Err(Error::ProtocolViolation("bad piece payload"));
                    }
                    Message::Piece {
                        piece_index: payload.get_u32() as PieceIndex,
                        offset: payload.get_u32(),
                        data: payload.to_vec(),
                    }
                }
                20 => {
                    if payload_len < 1 {
                        return Err(Error::ProtocolViolation(
                            "bad extended payload",
                        ));
                    }
                    Message::Extended {
                        id: payload.get_u8(),
                        payload: payload.to_vec(),
                    }
                }
                other => {
                    // unknown ids are tolerated for forward compatibility
                    log::debug!("Skipping frame with unknown message id {}", other);
                    continue;
                }
            };
            return Ok(Some(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;
    use pretty_assertions::assert_eq;

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    fn decode(buf: &mut BytesMut) -> Result<Option<Message>> {
        PeerCodec.decode(buf)
    }

    #[test]
    fn test_handshake_round_trip() {
        let ours = Handshake::new([0xaa; 20], *b"td-00000000000000000");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(ours, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let theirs = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(theirs.info_hash, ours.info_hash);
        assert_eq!(theirs.peer_id, ours.peer_id);
        assert!(theirs.supports_extensions());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_needs_all_68_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(PROTOCOL_STRING);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_handshake_rejects_foreign_protocols() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"BitTorrent protocol");
        buf[1] = b'X';
        buf.put_slice(&[0; 48]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_message_round_trips() {
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 42 },
            Message::Bitfield(Bitfield::from_vec(vec![0b1010_0000])),
            Message::Request(BlockInfo {
                piece_index: 1,
                offset: BLOCK_LEN,
                len: BLOCK_LEN,
            }),
            Message::Piece {
                piece_index: 1,
                offset: BLOCK_LEN,
                data: vec![0xfe; 100],
            },
            Message::Cancel(BlockInfo {
                piece_index: 3,
                offset: 0,
                len: BLOCK_LEN,
            }),
            Message::Extended {
                id: 0,
                payload: b"d1:md6:ut_pexi1eee".to_vec(),
            },
        ];

        for msg in messages {
            let mut buf = encode(msg.clone());
            assert_eq!(decode(&mut buf).unwrap(), Some(msg));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut buf = encode(Message::Have { piece_index: 1 });
        let tail = buf.split_off(5);
        assert_eq!(decode(&mut buf).unwrap(), None);
        buf.unsplit(tail);
        assert_eq!(
            decode(&mut buf).unwrap(),
            Some(Message::Have { piece_index: 1 })
        );
    }

    #[test]
    fn test_payload_length_is_strict() {
        // a choke with a stray payload byte
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(0);
        buf.put_u8(0xff);
        assert!(decode(&mut buf).is_err());

        // a have with a short index
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(4);
        buf.put_u16(7);
        assert!(decode(&mut buf).is_err());

        // a request missing its length field
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        buf.put_u8(6);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_frame_is_rejected_up_front() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_ids_are_skipped() {
        let mut buf = BytesMut::new();
        // a BEP 6 "have all" frame, which we don't speak
        buf.put_u32(1);
        buf.put_u8(0x0e);
        // followed by a regular unchoke
        buf.put_u32(1);
        buf.put_u8(1);

        assert_eq!(decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_keep_alive() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert_eq!(decode(&mut buf).unwrap(), Some(Message::KeepAlive));
    }
}
