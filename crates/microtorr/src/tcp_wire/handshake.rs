//! The first frame of every connection: protocol name, swarm id and the
//! sender's peer id.
//!
//! It is the only frame without a length prefix and it is exchanged once, so
//! it gets its own codec. Once both sides sent theirs, the connection moves
//! to [`MessageCodec`](super::MessageCodec) keeping the read buffer, which
//! may already hold the first messages.

use std::{io, io::Cursor};

use bytes::{Buf, BufMut, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{error::Error, metainfo::SwarmId, peer::PeerId};

/// Identifies the protocol, a peer speaking anything else is dropped.
pub const PSTR: [u8; 11] = *b"MICROTORRv1";

/// Size of an encoded handshake, in bytes.
pub const HANDSHAKE_LEN: usize = 1 + PSTR.len() + 20 + 20;

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake { pstr_len, pstr, swarm_id, peer_id } = handshake;

        debug_assert_eq!(pstr_len as usize, PSTR.len());
        debug_assert_eq!(pstr, PSTR);

        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(pstr.len() as u8);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&swarm_id.0);
        buf.extend_from_slice(peer_id.as_bytes());

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the length prefix without consuming it, the full
        // handshake might not be in the buffer yet.
        let mut tmp_buf = Cursor::new(&buf[..]);
        let prot_len = tmp_buf.get_u8() as usize;
        if prot_len != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Handshake must have the string \"MICROTORRv1\"",
            ));
        }

        if buf.remaining() < HANDSHAKE_LEN {
            return Ok(None);
        }
        buf.advance(1);

        let mut pstr = [0; 11];
        buf.copy_to_slice(&mut pstr);
        let mut swarm_id = [0; 20];
        buf.copy_to_slice(&mut swarm_id);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr_len: prot_len as u8,
            pstr,
            swarm_id: SwarmId(swarm_id),
            peer_id: PeerId::from(peer_id),
        }))
    }
}

/// pstrlen = 11
/// pstr = "MICROTORRv1"
/// The very first record exchanged in each direction. If the peer's protocol
/// string or swarm id differs from ours, the connection is severed before any
/// other message is read.
#[derive(Clone, Debug, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 11],
    pub swarm_id: SwarmId,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(swarm_id: SwarmId, peer_id: PeerId) -> Self {
        Self { pstr_len: PSTR.len() as u8, pstr: PSTR, swarm_id, peer_id }
    }

    pub fn serialize(&self) -> Result<[u8; HANDSHAKE_LEN], Error> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }

    /// Check a handshake received from a peer against ours.
    pub fn validate(&self, target: &Self) -> bool {
        if target.pstr_len as usize != PSTR.len() {
            warn!("protocol name length mismatch, dropping connection");
            return false;
        }
        if target.pstr != PSTR {
            warn!("unknown protocol name, dropping connection");
            return false;
        }
        if self.swarm_id != target.swarm_id {
            warn!("handshake is for another swarm, dropping connection");
            return false;
        }
        if self.peer_id == target.peer_id {
            warn!("peer answered with our own id, dropping connection");
            return false;
        }
        true
    }
}
