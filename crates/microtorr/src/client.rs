//! A client of one swarm: owns the tasks of the transport, the router, the
//! uploader and the scheduler, and waits on the shutdown barrier.
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    config::ResolvedConfig,
    control::{ControlMessage, Payload},
    error::Error,
    metainfo::MetaInfo,
    peer::PeerId,
    rate_limit::RateLimiter,
    router::Router,
    scheduler::Scheduler,
    shutdown::{listen_for_signals, Exit, Shutdown},
    swarm::{SeedState, SwarmCtx},
    tracker::{notify_tracker, Event, Tracker, TrackerMsg},
    uploader::Uploader,
    utils::default_route_ip,
    wire::PeerWire,
};

const CHANNEL_SIZE: usize = 256;

/// How long queued messages get to reach peers once the client stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Client {
    meta: MetaInfo,
    config: ResolvedConfig,
    local_id: PeerId,
    shutdown: Arc<Shutdown>,
}

impl Client {
    pub fn new(meta: MetaInfo, config: ResolvedConfig) -> Self {
        Self {
            meta,
            config,
            local_id: PeerId::generate(),
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Handle to the barrier, to stop the client from outside.
    pub fn shutdown(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    /// Where the downloaded file is written.
    pub fn output(&self) -> PathBuf {
        self.config
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.meta.info.name))
    }

    /// Join the swarm through the tracker of the descriptor and run until
    /// the download completes or the client is stopped.
    pub async fn start(self) -> Result<Exit, Error> {
        let listener =
            TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port)))
                .await?;
        let port = listener.local_addr()?.port();

        let ip = match self.config.ip {
            Some(ip) => ip,
            None => default_route_ip().await?,
        };
        info!("listening on {ip}:{port} as {:?}", self.local_id);

        let tracker = Tracker::new(
            &self.meta.announce,
            self.local_id,
            self.meta.swarm_id(),
            ip,
            port,
        )?;
        let peers = tracker.announce_started().await?.peer_addrs(&self.local_id);
        let tracker_tx = tracker.tx.clone();
        tokio::spawn(tracker.run());

        self.run(listener, peers, Some(tracker_tx)).await
    }

    /// Run the client against an already known swarm snapshot.
    #[tracing::instrument(skip_all, fields(id = %self.local_id.short()))]
    pub async fn run(
        self,
        listener: TcpListener,
        peers: Vec<(PeerId, SocketAddr)>,
        tracker_tx: Option<mpsc::Sender<TrackerMsg>>,
    ) -> Result<Exit, Error> {
        let seed = SeedState::new(self.config.seed.clone(), self.config.auto_seed);
        let ctx = Arc::new(SwarmCtx::new(self.meta.piece_hashes(), seed));

        if let Some(source) = &self.config.seed {
            if let Err(e) = ctx.store.load_seed(source, self.meta.info.piece_length).await {
                self.shutdown.fail(e).await;
                notify_tracker(tracker_tx.as_ref(), Event::Stopped).await;
                return Ok(self.shutdown.wait().await);
            }
            info!("seeding {source:?}");
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_SIZE);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_SIZE);
        let (uploader_tx, uploader_rx) = mpsc::channel(CHANNEL_SIZE);

        let wire = PeerWire::new(
            self.local_id,
            self.meta.swarm_id(),
            inbound_tx,
            RateLimiter::new(self.config.download_rate),
            RateLimiter::new(self.config.upload_rate),
            self.shutdown.clone(),
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let mut outbound = {
            let wire = wire.clone();
            tokio::spawn(async move { wire.run_outbound(outbound_rx).await })
        };
        {
            let wire = wire.clone();
            tasks.push(tokio::spawn(async move { wire.accept(listener).await }));
        }

        let scheduler_tx = if ctx.seed.is_active() {
            None
        } else {
            let (scheduler_tx, scheduler_rx) = mpsc::channel(CHANNEL_SIZE);
            let scheduler = Scheduler::new(
                ctx.clone(),
                scheduler_rx,
                outbound_tx.clone(),
                tracker_tx.clone(),
                self.shutdown.clone(),
                self.config.scheduler(self.output()),
                self.meta.info.file_hash,
            );
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = scheduler.run().await {
                    if !shutdown.is_released() {
                        shutdown.fail(e).await;
                    }
                }
            }));
            Some(scheduler_tx)
        };

        let router = Router::new(
            ctx.clone(),
            inbound_rx,
            outbound_tx.clone(),
            scheduler_tx,
            uploader_tx,
            self.shutdown.clone(),
        );
        tasks.push(tokio::spawn(router.run()));

        let uploader =
            Uploader::new(ctx.clone(), uploader_rx, outbound_tx.clone(), self.shutdown.clone());
        tasks.push(tokio::spawn(uploader.run()));

        for (peer_id, addr) in peers {
            if peer_id == self.local_id {
                continue;
            }
            let wire = wire.clone();
            tasks.push(tokio::spawn(async move {
                match wire.connect(addr).await {
                    Ok(id) if id != peer_id => {
                        warn!("{addr} answered as {id:?} instead of {peer_id:?}");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("could not connect to {peer_id:?} at {addr}: {e}"),
                }
            }));
        }

        tasks.push(tokio::spawn(listen_for_signals(
            self.shutdown.clone(),
            tracker_tx.clone(),
        )));

        let exit = self.shutdown.wait().await;

        if matches!(exit, Exit::Failed(_)) {
            notify_tracker(tracker_tx.as_ref(), Event::Stopped).await;
        }

        // let queued messages reach the peers before tearing down
        let exit_msg = ControlMessage::broadcast(Payload::Exit);
        let _ = timeout(FLUSH_TIMEOUT, outbound_tx.send(exit_msg)).await;
        let _ = timeout(FLUSH_TIMEOUT, &mut outbound).await;
        outbound.abort();

        for task in tasks {
            task.abort();
        }
        info!("client stopped");

        Ok(exit)
    }
}
