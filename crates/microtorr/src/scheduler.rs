//! Rarest-first piece scheduler.
//!
//! Once the swarm is large enough, every cycle picks one of the rarest
//! missing pieces and an owner biased towards the fastest one, requests the
//! piece and waits for that peer's answer on a private channel. When every
//! piece is owned the file is assembled, checked and written.
use std::{path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokio::{
    select,
    sync::mpsc,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    control::{ControlMessage, Payload},
    error::Error,
    metainfo::{sha1, HASH_LEN},
    peer::PeerId,
    shutdown::{Exit, Shutdown},
    stats::DownloadStats,
    swarm::{SwarmCtx, SPEED_REJECTED},
    tracker::{notify_tracker, Event, TrackerMsg},
    utils::to_human_readable,
};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub min_seeders: usize,
    pub min_leechers: usize,
    /// Probability of asking the fastest owner instead of a random one.
    pub opportunism: f64,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Where the assembled file is written.
    pub output: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_seeders: 0,
            min_leechers: 0,
            opportunism: 0.85,
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            output: PathBuf::from("out"),
        }
    }
}

/// How a request ended.
#[derive(Debug)]
enum Outcome {
    Piece(Bytes),
    Rejected,
    TimedOut,
    /// The peer disconnected before answering.
    Dead,
    /// The client is shutting down.
    Cancelled,
}

pub struct Scheduler {
    ctx: Arc<SwarmCtx>,
    /// Piece, reject and dead connection events forwarded by the router.
    rx: mpsc::Receiver<ControlMessage>,
    outbound_tx: mpsc::Sender<ControlMessage>,
    tracker_tx: Option<mpsc::Sender<TrackerMsg>>,
    shutdown: Arc<Shutdown>,
    config: SchedulerConfig,
    file_hash: [u8; HASH_LEN],
    stats: DownloadStats,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<SwarmCtx>,
        rx: mpsc::Receiver<ControlMessage>,
        outbound_tx: mpsc::Sender<ControlMessage>,
        tracker_tx: Option<mpsc::Sender<TrackerMsg>>,
        shutdown: Arc<Shutdown>,
        config: SchedulerConfig,
        file_hash: [u8; HASH_LEN],
    ) -> Self {
        Self {
            ctx,
            rx,
            outbound_tx,
            tracker_tx,
            shutdown,
            config,
            file_hash,
            stats: DownloadStats::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Download every missing piece, then assemble the file. Returns early,
    /// without error, when the client shuts down.
    #[tracing::instrument(skip_all, name = "scheduler")]
    pub async fn run(mut self) -> Result<(), Error> {
        if !self.wait_for_swarm().await {
            return Ok(());
        }

        loop {
            if self.shutdown.is_released() {
                return Ok(());
            }

            let have = self.ctx.store.have().await;
            let rarest = self.ctx.peers.rarest_pieces(&have).await;
            if rarest.is_empty() {
                break;
            }

            // pieces nobody connected owns must not hold back the others
            let available = self.ctx.peers.rarest_available(&have).await;
            let Some(&index) = available.choose(&mut self.rng) else {
                debug!("waiting for a peer owning any of pieces {rarest:?}");
                self.idle(self.config.poll_interval).await;
                continue;
            };

            let peer = self
                .ctx
                .peers
                .pick_peer(index, self.config.opportunism, &mut self.rng)
                .await;

            let Some(peer_id) = peer else {
                debug!("no connected peer owns piece {index}");
                self.idle(self.config.poll_interval).await;
                continue;
            };

            self.download_piece(index as u32, peer_id).await?;
        }

        self.assemble().await
    }

    /// Block until the swarm has enough seeders and leechers to start
    /// downloading, peers leaving later do not close the gate again. We count
    /// as a leecher ourselves. Returns false if the client shut down
    /// meanwhile.
    async fn wait_for_swarm(&mut self) -> bool {
        loop {
            if self.shutdown.is_released() {
                return false;
            }

            let seeders = self.ctx.peers.num_seeders().await;
            let leechers = self.ctx.peers.num_leechers().await + 1;

            if seeders >= self.config.min_seeders && leechers >= self.config.min_leechers {
                return true;
            }

            debug!(
                "waiting for the swarm, seeders: {seeders}/{} leechers: {leechers}/{}",
                self.config.min_seeders, self.config.min_leechers
            );
            self.idle(self.config.poll_interval).await;
        }
    }

    /// Sleep for `duration`, discarding whatever arrives meanwhile. Nothing
    /// is outstanding while idle.
    async fn idle(&mut self, duration: Duration) {
        let token = self.shutdown.token().clone();
        let sleep = sleep(duration);
        tokio::pin!(sleep);

        loop {
            select! {
                _ = &mut sleep => return,
                _ = token.cancelled() => return,
                msg = self.rx.recv() => match msg {
                    Some(msg) => trace!("idle, discarding {msg}"),
                    None => {
                        select! {
                            _ = &mut sleep => {}
                            _ = token.cancelled() => {}
                        }
                        return;
                    }
                },
            }
        }
    }

    async fn download_piece(&mut self, index: u32, peer_id: PeerId) -> Result<(), Error> {
        // answers to requests that were already given up on
        while let Ok(msg) = self.rx.try_recv() {
            trace!("discarding stale {msg}");
        }

        debug!("> request {index} to {peer_id:?}");
        let requested_at = Instant::now();
        self.outbound_tx
            .send(ControlMessage::to_peer(peer_id, Payload::Request(index)))
            .await?;

        match self.await_response(index, &peer_id).await {
            Outcome::Piece(data) => {
                let elapsed = requested_at.elapsed().as_secs_f64().max(f64::EPSILON);
                let len = data.len();
                let speed = len as f64 / elapsed;
                self.ctx.peers.set_speed(&peer_id, speed).await;

                // a piece that fails its hash check ends the download
                if self.ctx.store.add_piece(index, data).await? {
                    let from_seeder = self.ctx.peers.is_seeder(&peer_id).await;
                    self.stats.update(index, len, speed, peer_id, from_seeder);

                    info!(
                        "< piece {index} from {peer_id:?} at {}/s, {} missing",
                        to_human_readable(speed),
                        self.ctx.store.missing().await
                    );

                    self.outbound_tx
                        .send(ControlMessage::broadcast(Payload::Have(index)))
                        .await?;
                }
            }
            Outcome::Rejected => {
                debug!("< reject {index} from {peer_id:?}");
                self.ctx.peers.set_speed(&peer_id, SPEED_REJECTED).await;
            }
            Outcome::TimedOut => {
                warn!("{peer_id:?} did not answer the request for piece {index}");
                self.ctx.peers.set_speed(&peer_id, SPEED_REJECTED).await;
            }
            Outcome::Dead => {
                debug!("{peer_id:?} disconnected before sending piece {index}");
            }
            Outcome::Cancelled => {}
        }

        Ok(())
    }

    /// Wait for `peer_id` to answer the request for `index`. Events from
    /// other peers and answers to other pieces are dropped.
    async fn await_response(&mut self, index: u32, peer_id: &PeerId) -> Outcome {
        let token = self.shutdown.token().clone();
        let deadline = sleep(self.config.request_timeout);
        tokio::pin!(deadline);

        loop {
            let msg = select! {
                _ = token.cancelled() => return Outcome::Cancelled,
                _ = &mut deadline => return Outcome::TimedOut,
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return Outcome::Cancelled,
                },
            };

            if !msg.is_from(peer_id) {
                trace!("waiting on {peer_id:?}, ignoring {msg}");
                continue;
            }

            match msg.payload {
                Payload::Piece { index: i, data } if i == index => return Outcome::Piece(data),
                Payload::Reject(i) if i == index => return Outcome::Rejected,
                Payload::DeadConnection => return Outcome::Dead,
                other => trace!("waiting for piece {index}, ignoring {}", other.opcode()),
            }
        }
    }

    /// Concatenate the pieces, check the whole file hash and write it out.
    /// Then either keep seeding it or leave the swarm.
    async fn assemble(&mut self) -> Result<(), Error> {
        let Some(buf) = self.ctx.store.assemble().await else {
            warn!("assemble called with missing pieces");
            return Ok(());
        };

        let hash = sha1(&buf);
        if hash == self.file_hash {
            info!("file hash matches {}", hex::encode(hash));
        } else {
            error!(
                "file hash {} does not match the expected {}",
                hex::encode(hash),
                hex::encode(self.file_hash)
            );
        }

        tokio::fs::write(&self.config.output, &buf).await?;
        info!("wrote {:?}", self.config.output);
        info!("{}", self.stats);

        if self.ctx.seed.auto_continue() {
            self.ctx.seed.activate(self.config.output.clone()).await;
            info!("download complete, seeding {:?}", self.config.output);
        } else {
            notify_tracker(self.tracker_tx.as_ref(), Event::Completed).await;
            self.shutdown.release(Exit::Completed).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{distributions::Alphanumeric, Rng};
    use tokio::time::timeout;

    use super::*;
    use crate::{
        bitfield::{Bitfield, BitfieldExt},
        swarm::SeedState,
    };

    const PIECES: [&[u8]; 2] = [b"first piece", b"second"];

    struct Harness {
        ctx: Arc<SwarmCtx>,
        scheduler_tx: mpsc::Sender<ControlMessage>,
        outbound_rx: mpsc::Receiver<ControlMessage>,
        shutdown: Arc<Shutdown>,
        output: PathBuf,
        handle: tokio::task::JoinHandle<Result<(), Error>>,
    }

    fn temp_output() -> PathBuf {
        let name: String =
            rand::thread_rng().sample_iter(Alphanumeric).take(12).map(char::from).collect();
        std::env::temp_dir().join(format!("microtorr-scheduler-{name}"))
    }

    fn harness(config: SchedulerConfig, auto_seed: bool) -> Harness {
        let hashes = PIECES.iter().map(|p| sha1(p)).collect();
        let ctx = Arc::new(SwarmCtx::new(hashes, SeedState::new(None, auto_seed)));

        let (scheduler_tx, rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let shutdown = Arc::new(Shutdown::new());
        let output = config.output.clone();

        let scheduler = Scheduler::new(
            ctx.clone(),
            rx,
            outbound_tx,
            None,
            shutdown.clone(),
            config,
            sha1(&PIECES.concat()),
        );
        let handle = tokio::spawn(scheduler.run());

        Harness { ctx, scheduler_tx, outbound_rx, shutdown, output, handle }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(10),
            output: temp_output(),
            ..Default::default()
        }
    }

    fn peer(c: u8) -> PeerId {
        PeerId::from([c; 20])
    }

    async fn add_seeder(ctx: &SwarmCtx, id: PeerId) {
        let mut full = Bitfield::from_piece(PIECES.len());
        full.fill(true);
        ctx.peers.add_peer(id).await;
        ctx.peers.set_bitfield(&id, full).await;
    }

    async fn next_request(h: &mut Harness) -> (PeerId, u32) {
        let msg = timeout(Duration::from_secs(5), h.outbound_rx.recv()).await.unwrap().unwrap();
        match msg.payload {
            Payload::Request(index) => (msg.peer_id.unwrap(), index),
            other => panic!("expected a request, got {}", other.opcode()),
        }
    }

    async fn answer(h: &mut Harness, from: PeerId, index: u32) {
        let data = Bytes::from_static(PIECES[index as usize]);
        h.scheduler_tx
            .send(ControlMessage::to_peer(from, Payload::Piece { index, data }))
            .await
            .unwrap();
        let have = h.outbound_rx.recv().await.unwrap();
        assert_eq!(have.peer_id, None);
        assert_eq!(have.payload, Payload::Have(index));
    }

    #[tokio::test]
    async fn downloads_assembles_and_completes() {
        let mut h = harness(config(), false);
        let a = peer(b'a');
        add_seeder(&h.ctx, a).await;

        for _ in 0..PIECES.len() {
            let (to, index) = next_request(&mut h).await;
            assert_eq!(to, a);
            answer(&mut h, a, index).await;
        }

        assert!(matches!(h.shutdown.wait().await, Exit::Completed));
        h.handle.await.unwrap().unwrap();

        assert_eq!(tokio::fs::read(&h.output).await.unwrap(), PIECES.concat());
        assert!(h.ctx.peers.speed(&a).await.unwrap() > 0.0);
        let _ = tokio::fs::remove_file(&h.output).await;
    }

    #[tokio::test]
    async fn dead_peer_releases_the_request() {
        let mut h = harness(config(), false);
        let (a, b) = (peer(b'a'), peer(b'b'));
        add_seeder(&h.ctx, a).await;
        add_seeder(&h.ctx, b).await;

        let (chosen, _) = next_request(&mut h).await;
        let other = if chosen == a { b } else { a };

        // a dead connection from another peer is ignored
        h.ctx.peers.delete_peer(&chosen).await;
        h.scheduler_tx
            .send(ControlMessage::to_peer(peer(b'z'), Payload::DeadConnection))
            .await
            .unwrap();
        h.scheduler_tx
            .send(ControlMessage::to_peer(chosen, Payload::DeadConnection))
            .await
            .unwrap();

        // nothing was downloaded, both pieces are asked from the peer left
        for _ in 0..PIECES.len() {
            let (to, index) = next_request(&mut h).await;
            assert_eq!(to, other);
            answer(&mut h, other, index).await;
        }

        assert!(matches!(h.shutdown.wait().await, Exit::Completed));
        let _ = tokio::fs::remove_file(&h.output).await;
    }

    #[tokio::test]
    async fn reject_and_timeout_deprioritize_the_peer() {
        let mut h = harness(
            SchedulerConfig { request_timeout: Duration::from_millis(50), ..config() },
            false,
        );
        let a = peer(b'a');
        add_seeder(&h.ctx, a).await;

        let (_, index) = next_request(&mut h).await;
        h.scheduler_tx
            .send(ControlMessage::to_peer(a, Payload::Reject(index)))
            .await
            .unwrap();

        // the only owner is asked again, even after rejecting us
        let (to, _) = next_request(&mut h).await;
        assert_eq!(to, a);
        assert_eq!(h.ctx.peers.speed(&a).await, Some(SPEED_REJECTED));

        // no answer at all, the request times out and is retried
        let (to, _) = next_request(&mut h).await;
        assert_eq!(to, a);

        h.shutdown.release(Exit::Interrupted).await;
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn corrupt_piece_is_fatal() {
        let mut h = harness(config(), false);
        let a = peer(b'a');
        add_seeder(&h.ctx, a).await;

        let (_, index) = next_request(&mut h).await;
        let data = Bytes::from_static(b"garbage");
        h.scheduler_tx
            .send(ControlMessage::to_peer(a, Payload::Piece { index, data }))
            .await
            .unwrap();

        let err = h.handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::PieceInvalid(i) if i == index));
        assert!(err.is_fatal());
        assert!(!h.ctx.store.has_piece(index as usize).await);
    }

    #[tokio::test]
    async fn unowned_piece_does_not_stall_the_others() {
        let mut h = harness(config(), false);
        let a = peer(b'a');
        h.ctx.peers.add_peer(a).await;
        h.ctx.peers.add_piece(&a, 1).await;

        // piece 0 has no owner, piece 1 is fetched meanwhile
        let (to, index) = next_request(&mut h).await;
        assert_eq!((to, index), (a, 1));
        answer(&mut h, a, 1).await;
        assert!(timeout(Duration::from_millis(100), h.outbound_rx.recv()).await.is_err());

        h.ctx.peers.add_piece(&a, 0).await;
        let (to, index) = next_request(&mut h).await;
        assert_eq!((to, index), (a, 0));
        answer(&mut h, a, 0).await;

        assert!(matches!(h.shutdown.wait().await, Exit::Completed));
        let _ = tokio::fs::remove_file(&h.output).await;
    }

    #[tokio::test]
    async fn gate_waits_for_seeders() {
        let mut h = harness(SchedulerConfig { min_seeders: 1, ..config() }, false);
        let a = peer(b'a');

        // a leecher does not open the gate
        h.ctx.peers.add_peer(a).await;
        h.ctx.peers.add_piece(&a, 0).await;
        assert!(timeout(Duration::from_millis(100), h.outbound_rx.recv()).await.is_err());

        h.ctx.peers.add_piece(&a, 1).await;
        let (to, _) = next_request(&mut h).await;
        assert_eq!(to, a);

        h.shutdown.release(Exit::Interrupted).await;
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn auto_seed_keeps_the_client_running() {
        let mut h = harness(config(), true);
        let a = peer(b'a');
        add_seeder(&h.ctx, a).await;

        for _ in 0..PIECES.len() {
            let (_, index) = next_request(&mut h).await;
            answer(&mut h, a, index).await;
        }
        h.handle.await.unwrap().unwrap();

        assert!(!h.shutdown.is_released());
        assert!(h.ctx.seed.is_active());
        assert_eq!(h.ctx.seed.source().await, Some(h.output.clone()));
        let _ = tokio::fs::remove_file(&h.output).await;
    }
}
