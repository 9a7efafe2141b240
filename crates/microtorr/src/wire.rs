//! Wire transport: a typed message bus on top of every peer connection.
//!
//! Each handshaked connection gets one receive task feeding the shared inbound
//! channel. Everything sent to peers goes through one outbound channel,
//! drained by a single task in order. Transport failures never surface as
//! errors, they become a `DEAD_CONNECTION` event emitted exactly once per
//! connection.
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::{stream::SplitSink, SinkExt, StreamExt};
use hashbrown::HashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    control::{ControlMessage, Payload},
    error::Error,
    handshake_peer::{self, PeerSocket},
    metainfo::SwarmId,
    peer::PeerId,
    rate_limit::RateLimiter,
    shutdown::Shutdown,
    tcp_wire::{Handshake, Message},
};

type PeerSink = Arc<Mutex<SplitSink<PeerSocket, Message>>>;

struct Connection {
    id: u64,
    /// The peer that opened the connection.
    dialer: PeerId,
    sink: PeerSink,
    /// Stops the receive task of this connection.
    cancel: CancellationToken,
}

pub struct WireCtx {
    pub local_id: PeerId,
    pub swarm_id: SwarmId,
    /// Registered connections. Readers and writers of the table are
    /// serialized by this lock, which is never held across socket I/O.
    connections: Mutex<HashMap<PeerId, Connection>>,
    next_connection: AtomicU64,
    inbound_tx: mpsc::Sender<ControlMessage>,
    download: RateLimiter,
    upload: RateLimiter,
    shutdown: Arc<Shutdown>,
}

/// Cheap to clone handle to the transport of a client.
#[derive(Clone)]
pub struct PeerWire {
    pub ctx: Arc<WireCtx>,
}

impl PeerWire {
    pub fn new(
        local_id: PeerId,
        swarm_id: SwarmId,
        inbound_tx: mpsc::Sender<ControlMessage>,
        download: RateLimiter,
        upload: RateLimiter,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            ctx: Arc::new(WireCtx {
                local_id,
                swarm_id,
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(0),
                inbound_tx,
                download,
                upload,
                shutdown,
            }),
        }
    }

    fn handshake(&self) -> Handshake {
        Handshake::new(self.ctx.swarm_id, self.ctx.local_id)
    }

    /// Dial a peer and perform the active side of the handshake. On success
    /// the peer is registered and its id returned. A handshake mismatch is
    /// only reported to the caller, no event is emitted.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId, Error> {
        let socket = TcpStream::connect(addr).await?;
        let (peer_id, socket) = handshake_peer::outbound(socket, self.handshake()).await?;

        info!("connected to {peer_id:?} at {addr}");
        self.register(peer_id, socket, self.ctx.local_id).await;
        Ok(peer_id)
    }

    /// Accept inbound connections until the client shuts down.
    pub async fn accept(&self, listener: TcpListener) {
        let token = self.ctx.shutdown.token().clone();

        loop {
            let (socket, addr) = select! {
                _ = token.cancelled() => return,
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("failed to accept a connection: {e}");
                        continue;
                    }
                },
            };

            let wire = self.clone();
            tokio::spawn(async move {
                match handshake_peer::inbound(socket, wire.handshake()).await {
                    Ok((peer_id, socket)) => {
                        info!("accepted {peer_id:?} from {addr}");
                        wire.register(peer_id, socket, peer_id).await;
                    }
                    Err(e) => debug!("dropping connection from {addr}: {e}"),
                }
            });
        }
    }

    /// Add a handshaked connection to the table, announce it and start its
    /// receive loop.
    ///
    /// When two peers dial each other at the same time both sides end up
    /// with two connections. Both keep the one dialled by the lower peer id,
    /// so the same socket survives on each end. Any other second connection
    /// to a registered peer is dropped.
    async fn register(&self, peer_id: PeerId, socket: PeerSocket, dialer: PeerId) {
        let (sink, stream) = socket.split();
        let cancel = self.ctx.shutdown.token().child_token();
        let id = self.ctx.next_connection.fetch_add(1, Ordering::Relaxed);

        let replaced = {
            let mut connections = self.ctx.connections.lock().await;
            if let Some(existing) = connections.get(&peer_id) {
                if existing.dialer <= dialer {
                    debug!("{peer_id:?} is already connected, dropping duplicate");
                    return;
                }
            }
            connections.insert(
                peer_id,
                Connection {
                    id,
                    dialer,
                    sink: Arc::new(Mutex::new(sink)),
                    cancel: cancel.clone(),
                },
            )
        };

        if let Some(old) = replaced {
            // its receive loop sees a stale id and leaves the table alone
            old.cancel.cancel();
            debug!("{peer_id:?} dialled us too, keeping the connection opened by {dialer:?}");
        }

        // NEW_CONNECTION is queued before any message of this peer. It is
        // sent again after a swap so the bitfield goes over the kept socket.
        let _ = self
            .ctx
            .inbound_tx
            .send(ControlMessage::to_peer(peer_id, Payload::NewConnection))
            .await;

        let wire = self.clone();
        tokio::spawn(async move {
            wire.receive_loop(peer_id, id, stream, cancel).await;
        });
    }

    /// Decode messages of one peer until its connection fails or is closed.
    #[tracing::instrument(skip_all, fields(peer = ?peer_id))]
    async fn receive_loop(
        &self,
        peer_id: PeerId,
        id: u64,
        mut stream: futures::stream::SplitStream<PeerSocket>,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = select! {
                _ = cancel.cancelled() => break,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(msg)) => {
                    trace!("< {:?}", msg.id());
                    self.ctx.download.consume(msg.len()).await;

                    let msg = ControlMessage::to_peer(peer_id, msg.into());
                    if self.ctx.inbound_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) if e.is_protocol_violation() => {
                    warn!("protocol violation: {e}");
                    self.remove(&peer_id, Some(id)).await;
                    self.ctx.shutdown.fail(e).await;
                    return;
                }
                Some(Err(e)) => {
                    debug!("read failed: {e}");
                    break;
                }
                None => {
                    debug!("peer closed the connection");
                    break;
                }
            }
        }

        self.remove(&peer_id, Some(id)).await;
    }

    /// Disconnect a peer. Only the caller that actually removes it from the
    /// table emits `DEAD_CONNECTION`, which makes the event unique.
    pub async fn drop_peer(&self, peer_id: &PeerId) -> bool {
        self.remove(peer_id, None).await
    }

    /// Remove the connection of a peer, only if it is still connection `id`
    /// when one is given.
    async fn remove(&self, peer_id: &PeerId, id: Option<u64>) -> bool {
        let conn = {
            let mut connections = self.ctx.connections.lock().await;
            let current = connections
                .get(peer_id)
                .is_some_and(|conn| id.map_or(true, |id| id == conn.id));
            if !current {
                return false;
            }
            connections.remove(peer_id)
        };
        let Some(conn) = conn else { return false };
        conn.cancel.cancel();
        info!("{peer_id:?} disconnected");

        let _ = self
            .ctx
            .inbound_tx
            .send(ControlMessage::to_peer(*peer_id, Payload::DeadConnection))
            .await;
        true
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.ctx.connections.lock().await.keys().copied().collect()
    }

    async fn sink(&self, peer_id: &PeerId) -> Option<(u64, PeerSink)> {
        self.ctx.connections.lock().await.get(peer_id).map(|c| (c.id, c.sink.clone()))
    }

    /// Encode and write one message. A write failure tears the connection
    /// down the same way a read failure does.
    pub async fn send(&self, peer_id: &PeerId, msg: Message) -> Result<(), Error> {
        let Some((id, sink)) = self.sink(peer_id).await else {
            debug!("{peer_id:?} is not connected, dropping {:?}", msg.id());
            return Ok(());
        };

        self.ctx.upload.consume(msg.len()).await;
        trace!("> {:?} to {peer_id:?}", msg.id());

        let res = sink.lock().await.send(msg).await;
        if let Err(e) = res {
            debug!("write to {peer_id:?} failed: {e}");
            self.remove(peer_id, Some(id)).await;
            return Err(e);
        }
        Ok(())
    }

    /// Send a message to every connected peer.
    pub async fn broadcast(&self, msg: Message) {
        for peer_id in self.connected_peers().await {
            let _ = self.send(&peer_id, msg.clone()).await;
        }
    }

    /// Deliver everything queued on the outbound channel, in order, until an
    /// `EXIT` message arrives or every sender is gone.
    pub async fn run_outbound(&self, mut outbound_rx: mpsc::Receiver<ControlMessage>) {
        while let Some(ControlMessage { peer_id, payload }) = outbound_rx.recv().await {
            if payload == Payload::Exit {
                debug!("outbound delivery stopped");
                return;
            }
            let msg = match Message::try_from(payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("cannot deliver to peers: {e}");
                    continue;
                }
            };
            match peer_id {
                Some(peer_id) => {
                    let _ = self.send(&peer_id, msg).await;
                }
                None => self.broadcast(msg).await,
            }
        }
    }
}
