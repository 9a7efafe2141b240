//! Control messages, the unit of communication between the tasks of a
//! client.
//!
//! The wire transport decodes peer messages once and turns them into a
//! [`ControlMessage`]. Every other component matches on the typed
//! [`Payload`] instead of inspecting raw bytes.
use std::fmt::Display;

use bytes::Bytes;

use crate::{bitfield::Bitfield, error::Error, peer::PeerId, tcp_wire::Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    NewConnection,
    DeadConnection,
    Handshake,
    Have,
    Bitfield,
    Request,
    Reject,
    Piece,
    Hello,
    Exit,
}

impl Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Opcode::NewConnection => "NEW_CONNECTION",
            Opcode::DeadConnection => "DEAD_CONNECTION",
            Opcode::Handshake => "HANDSHAKE",
            Opcode::Have => "HAVE",
            Opcode::Bitfield => "BITFIELD",
            Opcode::Request => "REQUEST",
            Opcode::Reject => "REJECT",
            Opcode::Piece => "PIECE",
            Opcode::Hello => "HELLO",
            Opcode::Exit => "EXIT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A peer finished its handshake and was registered.
    NewConnection,
    /// A peer was removed from the connection table.
    DeadConnection,
    /// Handshakes never leave the transport, seeing one elsewhere is a bug.
    Handshake,
    Have(u32),
    Bitfield(Bitfield),
    Request(u32),
    Reject(u32),
    Piece { index: u32, data: Bytes },
    Hello(String),
    /// Stops the outbound delivery task.
    Exit,
}

impl Payload {
    pub fn opcode(&self) -> Opcode {
        match self {
            Payload::NewConnection => Opcode::NewConnection,
            Payload::DeadConnection => Opcode::DeadConnection,
            Payload::Handshake => Opcode::Handshake,
            Payload::Have(_) => Opcode::Have,
            Payload::Bitfield(_) => Opcode::Bitfield,
            Payload::Request(_) => Opcode::Request,
            Payload::Reject(_) => Opcode::Reject,
            Payload::Piece { .. } => Opcode::Piece,
            Payload::Hello(_) => Opcode::Hello,
            Payload::Exit => Opcode::Exit,
        }
    }
}

/// A message traveling between tasks. A `peer_id` of `None` means broadcast
/// on the outbound channel, and "no particular peer" elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub peer_id: Option<PeerId>,
    pub payload: Payload,
}

impl ControlMessage {
    pub fn to_peer(peer_id: PeerId, payload: Payload) -> Self {
        Self { peer_id: Some(peer_id), payload }
    }

    pub fn broadcast(payload: Payload) -> Self {
        Self { peer_id: None, payload }
    }

    pub fn opcode(&self) -> Opcode {
        self.payload.opcode()
    }

    /// True if this message concerns `peer_id`.
    pub fn is_from(&self, peer_id: &PeerId) -> bool {
        self.peer_id.as_ref() == Some(peer_id)
    }
}

impl Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.peer_id {
            Some(id) => write!(f, "{} [{}]", self.opcode(), id.short()),
            None => write!(f, "{} [*]", self.opcode()),
        }
    }
}

impl From<Message> for Payload {
    fn from(value: Message) -> Self {
        match value {
            Message::Have(index) => Payload::Have(index),
            Message::Bitfield(bitfield) => Payload::Bitfield(bitfield),
            Message::Request(index) => Payload::Request(index),
            Message::Reject(index) => Payload::Reject(index),
            Message::Piece { index, data } => Payload::Piece { index, data },
            Message::HelloDebug(text) => Payload::Hello(text),
        }
    }
}

impl TryFrom<Payload> for Message {
    type Error = Error;

    /// Only the payloads that have a wire representation can be sent to
    /// peers.
    fn try_from(value: Payload) -> Result<Self, Self::Error> {
        match value {
            Payload::Have(index) => Ok(Message::Have(index)),
            Payload::Bitfield(bitfield) => Ok(Message::Bitfield(bitfield)),
            Payload::Request(index) => Ok(Message::Request(index)),
            Payload::Reject(index) => Ok(Message::Reject(index)),
            Payload::Piece { index, data } => Ok(Message::Piece { index, data }),
            Payload::Hello(text) => Ok(Message::HelloDebug(text)),
            other => Err(Error::UnexpectedMessage(other.opcode().to_string())),
        }
    }
}
