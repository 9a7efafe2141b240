//! Messages exchanged between peers after the handshake.
//!
//! Every message is framed as `<u32 length><u8 id><payload>`, where the length
//! counts the id byte and the payload.
pub mod handshake;

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{bitfield::Bitfield, error::Error};

pub use handshake::{Handshake, HandshakeCodec, HANDSHAKE_LEN, PSTR};

/// Frames above this size are refused.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Id and index bytes in front of the data of a `PIECE` frame.
pub const PIECE_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Have(u32),
    Bitfield(Bitfield),
    Request(u32),
    Reject(u32),
    Piece { index: u32, data: Bytes },
    HelloDebug(String),
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Reject = 7,
    Piece = 8,
    HelloDebug = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            k if k == Have as u8 => Ok(Have),
            k if k == Bitfield as u8 => Ok(Bitfield),
            k if k == Request as u8 => Ok(Request),
            k if k == Reject as u8 => Ok(Reject),
            k if k == Piece as u8 => Ok(Piece),
            k if k == HelloDebug as u8 => Ok(HelloDebug),
            _ => Err(Error::UnknownMessageId(k)),
        }
    }
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Have(_) => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request(_) => MessageId::Request,
            Message::Reject(_) => MessageId::Reject,
            Message::Piece { .. } => MessageId::Piece,
            Message::HelloDebug(_) => MessageId::HelloDebug,
        }
    }

    /// Length of the encoded frame, including the length prefix.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        4 + 1
            + match self {
                Message::Have(_) | Message::Request(_) | Message::Reject(_) => 4,
                Message::Bitfield(b) => b.as_raw_slice().len(),
                Message::Piece { data, .. } => 4 + data.len(),
                Message::HelloDebug(text) => text.len(),
            }
    }
}

#[derive(Debug, Clone)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<(), Error> {
        let len = item.len();
        if len - 4 > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(len - 4));
        }
        buf.reserve(len);
        buf.put_u32((len - 4) as u32);
        buf.put_u8(item.id() as u8);

        match item {
            Message::Have(index)
            | Message::Request(index)
            | Message::Reject(index) => {
                buf.put_u32(index);
            }
            Message::Bitfield(bitfield) => {
                buf.extend_from_slice(bitfield.as_raw_slice());
            }
            Message::Piece { index, data } => {
                buf.put_u32(index);
                buf.extend_from_slice(&data);
            }
            Message::HelloDebug(text) => {
                buf.extend_from_slice(text.as_bytes());
            }
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        // the message length header must be present at the minimum, otherwise
        // we can't determine the message type
        if buf.remaining() < 4 {
            return Ok(None);
        }

        // peek at the length without advancing, the payload may still be
        // incomplete.
        let mut tmp_buf = Cursor::new(&buf[..4]);
        let msg_len = tmp_buf.get_u32() as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(msg_len));
        }
        if msg_len == 0 {
            return Err(Error::MalformedMessage("empty"));
        }

        if buf.remaining() < 4 + msg_len {
            buf.reserve(4 + msg_len - buf.remaining());
            return Ok(None);
        }
        buf.advance(4);

        let id = MessageId::try_from(buf.get_u8())?;
        let mut payload = buf.split_to(msg_len - 1);

        let msg = match id {
            MessageId::Have => Message::Have(read_index(&mut payload, "have")?),
            MessageId::Request => {
                Message::Request(read_index(&mut payload, "request")?)
            }
            MessageId::Reject => {
                Message::Reject(read_index(&mut payload, "reject")?)
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
            }
            MessageId::Piece => {
                if payload.remaining() < 4 {
                    return Err(Error::MalformedMessage("piece"));
                }
                let index = payload.get_u32();
                Message::Piece { index, data: payload.freeze() }
            }
            MessageId::HelloDebug => {
                Message::HelloDebug(String::from_utf8(payload.to_vec())?)
            }
        };

        Ok(Some(msg))
    }
}

/// Payload made of a single piece index.
fn read_index(payload: &mut BytesMut, kind: &'static str) -> Result<u32, Error> {
    if payload.remaining() != 4 {
        return Err(Error::MalformedMessage(kind));
    }
    Ok(payload.get_u32())
}
