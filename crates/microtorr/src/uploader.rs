//! Serves piece requests from the local store.
use std::sync::Arc;

use tokio::{select, sync::mpsc};
use tracing::{debug, trace};

use crate::{
    control::{ControlMessage, Payload},
    shutdown::Shutdown,
    swarm::SwarmCtx,
};

pub struct Uploader {
    ctx: Arc<SwarmCtx>,
    rx: mpsc::Receiver<ControlMessage>,
    outbound_tx: mpsc::Sender<ControlMessage>,
    shutdown: Arc<Shutdown>,
}

impl Uploader {
    pub fn new(
        ctx: Arc<SwarmCtx>,
        rx: mpsc::Receiver<ControlMessage>,
        outbound_tx: mpsc::Sender<ControlMessage>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self { ctx, rx, outbound_tx, shutdown }
    }

    /// Every request is answered on its own task, a slow peer does not hold
    /// up the others.
    #[tracing::instrument(skip_all, name = "uploader")]
    pub async fn run(mut self) {
        let token = self.shutdown.token().clone();

        loop {
            let msg = select! {
                _ = token.cancelled() => return,
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
            };

            let opcode = msg.opcode();
            let (Some(peer_id), Payload::Request(index)) = (msg.peer_id, msg.payload) else {
                debug!("uploader ignoring {opcode}");
                continue;
            };

            let ctx = self.ctx.clone();
            let outbound_tx = self.outbound_tx.clone();

            tokio::spawn(async move {
                let payload = match ctx.store.get_piece(index).await {
                    Some(data) => {
                        trace!("serving piece {index} to {peer_id:?}");
                        Payload::Piece { index, data }
                    }
                    None => {
                        debug!("rejecting request for piece {index} from {peer_id:?}");
                        Payload::Reject(index)
                    }
                };
                let _ = outbound_tx.send(ControlMessage::to_peer(peer_id, payload)).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{metainfo::sha1, peer::PeerId, swarm::SeedState};

    #[tokio::test]
    async fn serves_owned_pieces_and_rejects_the_rest() {
        let data = [Bytes::from_static(b"zero"), Bytes::from_static(b"one")];
        let hashes = data.iter().map(|d| sha1(d)).collect();
        let ctx = Arc::new(SwarmCtx::new(hashes, SeedState::new(None, false)));
        ctx.store.add_piece(0, data[0].clone()).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let shutdown = Arc::new(Shutdown::new());
        let handle = tokio::spawn(Uploader::new(ctx, rx, outbound_tx, shutdown.clone()).run());

        let peer = PeerId::from([b'q'; 20]);

        tx.send(ControlMessage::to_peer(peer, Payload::Request(0))).await.unwrap();
        let msg = outbound_rx.recv().await.unwrap();
        assert!(msg.is_from(&peer));
        assert_eq!(msg.payload, Payload::Piece { index: 0, data: data[0].clone() });

        tx.send(ControlMessage::to_peer(peer, Payload::Request(1))).await.unwrap();
        assert_eq!(outbound_rx.recv().await.unwrap().payload, Payload::Reject(1));

        // out of range indices are rejected too
        tx.send(ControlMessage::to_peer(peer, Payload::Request(9))).await.unwrap();
        assert_eq!(outbound_rx.recv().await.unwrap().payload, Payload::Reject(9));

        shutdown.release(crate::shutdown::Exit::Completed).await;
        handle.await.unwrap();
    }
}
