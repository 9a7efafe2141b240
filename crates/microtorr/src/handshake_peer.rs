//! Both sides of the handshake. On success the socket is handed back framed
//! with [`MessageCodec`], keeping whatever bytes were already buffered.
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};
use tracing::debug;

use crate::{
    error::Error,
    peer::PeerId,
    tcp_wire::{Handshake, HandshakeCodec, MessageCodec},
};

/// How long a peer has to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub type PeerSocket = Framed<TcpStream, MessageCodec>;

/// We initiated the connection: send our handshake first, then validate the
/// answer.
pub async fn outbound(
    socket: TcpStream,
    ours: Handshake,
) -> Result<(PeerId, PeerSocket), Error> {
    let mut socket = Framed::new(socket, HandshakeCodec);

    debug!("> handshake");
    socket.send(ours.clone()).await?;

    let theirs = read_handshake(&mut socket).await?;
    if !ours.validate(&theirs) {
        return Err(Error::HandshakeInvalid);
    }

    Ok((theirs.peer_id, into_message_codec(socket)))
}

/// The peer initiated the connection: validate its handshake before answering
/// with ours.
pub async fn inbound(
    socket: TcpStream,
    ours: Handshake,
) -> Result<(PeerId, PeerSocket), Error> {
    let mut socket = Framed::new(socket, HandshakeCodec);

    let theirs = read_handshake(&mut socket).await?;
    if !ours.validate(&theirs) {
        return Err(Error::HandshakeInvalid);
    }

    debug!("> handshake");
    socket.send(ours).await?;

    Ok((theirs.peer_id, into_message_codec(socket)))
}

async fn read_handshake(
    socket: &mut Framed<TcpStream, HandshakeCodec>,
) -> Result<Handshake, Error> {
    match timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
        Ok(Some(Ok(handshake))) => {
            debug!("< handshake from {:?}", handshake.peer_id);
            Ok(handshake)
        }
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(None) => Err(Error::PeerClosedSocket),
        Err(_) => Err(Error::NoHandshake),
    }
}

/// Switch codecs without dropping the read and write buffers, the peer may
/// have sent messages right after its handshake.
fn into_message_codec(socket: Framed<TcpStream, HandshakeCodec>) -> PeerSocket {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}
