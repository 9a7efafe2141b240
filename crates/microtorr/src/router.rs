//! The core hub: single consumer of the inbound event channel.
//!
//! It keeps [`SwarmPeers`](crate::swarm::SwarmPeers) in sync with membership,
//! bitfield and have events, and forwards requests to the uploader and
//! responses to the scheduler. It holds no state of its own.
use std::sync::Arc;

use tokio::{select, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    control::{ControlMessage, Payload},
    error::Error,
    shutdown::Shutdown,
    swarm::SwarmCtx,
};

pub struct Router {
    ctx: Arc<SwarmCtx>,
    inbound_rx: mpsc::Receiver<ControlMessage>,
    outbound_tx: mpsc::Sender<ControlMessage>,
    /// Absent when the client started as a seeder.
    scheduler_tx: Option<mpsc::Sender<ControlMessage>>,
    uploader_tx: mpsc::Sender<ControlMessage>,
    shutdown: Arc<Shutdown>,
}

impl Router {
    pub fn new(
        ctx: Arc<SwarmCtx>,
        inbound_rx: mpsc::Receiver<ControlMessage>,
        outbound_tx: mpsc::Sender<ControlMessage>,
        scheduler_tx: Option<mpsc::Sender<ControlMessage>>,
        uploader_tx: mpsc::Sender<ControlMessage>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self { ctx, inbound_rx, outbound_tx, scheduler_tx, uploader_tx, shutdown }
    }

    /// Route events until the inbound channel closes or the client shuts
    /// down. A fatal routing error releases the shutdown barrier.
    #[tracing::instrument(skip_all, name = "router")]
    pub async fn run(mut self) {
        let token = self.shutdown.token().clone();

        loop {
            let msg = select! {
                _ = token.cancelled() => return,
                msg = self.inbound_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
            };

            if let Err(e) = self.route(msg).await {
                self.shutdown.fail(e).await;
                return;
            }
        }
    }

    pub async fn route(&mut self, msg: ControlMessage) -> Result<(), Error> {
        let Some(peer_id) = msg.peer_id else {
            return Err(Error::UnexpectedMessage(format!("{msg} without a sender")));
        };

        match msg.payload {
            Payload::NewConnection => {
                self.ctx.peers.add_peer(peer_id).await;

                // let the new peer know what we have right away
                let have = self.ctx.store.have().await;
                self.outbound_tx
                    .send(ControlMessage::to_peer(peer_id, Payload::Bitfield(have)))
                    .await?;
            }
            Payload::DeadConnection => {
                self.ctx.peers.delete_peer(&peer_id).await;

                if !self.ctx.seed.is_active() {
                    self.forward_to_scheduler(msg).await;
                }
            }
            Payload::Have(index) => {
                if !self.ctx.peers.add_piece(&peer_id, index as usize).await {
                    debug!("ignoring have {index} from {peer_id:?}");
                }
            }
            Payload::Bitfield(bitfield) => {
                debug!(
                    "< bitfield from {peer_id:?} ones: {}",
                    bitfield.count_ones()
                );
                if !self.ctx.peers.set_bitfield(&peer_id, bitfield).await {
                    debug!("ignoring bitfield from unknown {peer_id:?}");
                }
            }
            Payload::Request(_) => {
                self.uploader_tx.send(msg).await?;
            }
            Payload::Piece { index, .. } => {
                if self.ctx.seed.is_active() {
                    // answer to a request that timed out before the download ended
                    if self.scheduler_tx.is_none() {
                        return Err(Error::PieceWhileSeeding(index));
                    }
                    debug!("dropping late piece {index} from {peer_id:?}");
                    return Ok(());
                }
                self.forward_to_scheduler(msg).await;
            }
            Payload::Reject(_) => {
                if !self.ctx.seed.is_active() {
                    self.forward_to_scheduler(msg).await;
                }
            }
            Payload::Hello(text) => {
                info!("hello from {peer_id:?}: {text}");
            }
            other => {
                return Err(Error::UnexpectedMessage(other.opcode().to_string()));
            }
        }

        Ok(())
    }

    async fn forward_to_scheduler(&self, msg: ControlMessage) {
        let Some(scheduler_tx) = &self.scheduler_tx else { return };
        if scheduler_tx.send(msg).await.is_err() {
            warn!("scheduler is gone, dropping message");
        }
    }
}
