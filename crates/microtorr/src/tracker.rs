//! HTTP client of the swarm tracker.
//!
//! The tracker only bootstraps membership: it returns the peers of a swarm
//! when we announce `started`, expects an `alive` announce at regular
//! intervals, and is told when we complete or stop.
use std::{
    fmt::Display,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use hashbrown::HashMap;
use serde::Deserialize;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{interval_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{error::Error, metainfo::SwarmId, peer::PeerId};

/// The tracker expires peers silent for 30 seconds.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Alive,
    Completed,
    Stopped,
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Event::Started => "started",
            Event::Alive => "alive",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Snapshot of a swarm, as returned by the tracker.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Swarm {
    pub id_hash: String,
    pub peers: Option<HashMap<String, TrackerPeer>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TrackerPeer {
    pub ip: String,
    pub port: u16,
    pub id: String,
}

impl Swarm {
    /// Peers we can dial, skipping ourselves and any entry with an invalid
    /// id or address.
    pub fn peer_addrs(&self, local_id: &PeerId) -> Vec<(PeerId, SocketAddr)> {
        let Some(peers) = &self.peers else { return Vec::new() };

        let mut addrs: Vec<(PeerId, SocketAddr)> = peers
            .values()
            .filter_map(|peer| {
                let id = PeerId::try_from(peer.id.as_str()).ok()?;
                let ip: IpAddr = peer.ip.parse().ok()?;
                Some((id, SocketAddr::new(ip, peer.port)))
            })
            .filter(|(id, _)| id != local_id)
            .collect();

        addrs.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        addrs
    }
}

#[derive(Debug)]
pub enum TrackerMsg {
    /// Announce a lifecycle event. The recipient is notified once the
    /// tracker answered, or failed to.
    Announce { event: Event, recipient: Option<oneshot::Sender<()>> },
}

/// Tell the tracker about a lifecycle event and wait for the
/// acknowledgement. Without a tracker the notification is a no-op.
pub async fn notify_tracker(
    tracker_tx: Option<&mpsc::Sender<TrackerMsg>>,
    event: Event,
) {
    let Some(tracker_tx) = tracker_tx else { return };
    let (otx, orx) = oneshot::channel();

    if tracker_tx
        .send(TrackerMsg::Announce { event, recipient: Some(otx) })
        .await
        .is_err()
    {
        debug!("tracker task is gone, skipping {event} announce");
        return;
    }
    let _ = orx.await;
}

pub struct Tracker {
    client: reqwest::Client,
    url: String,
    peer_id: PeerId,
    swarm_id: SwarmId,
    ip: IpAddr,
    port: u16,
    pub tx: mpsc::Sender<TrackerMsg>,
    rx: mpsc::Receiver<TrackerMsg>,
}

impl Tracker {
    pub fn new(
        url: &str,
        peer_id: PeerId,
        swarm_id: SwarmId,
        ip: IpAddr,
        port: u16,
    ) -> Result<Self, Error> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::TrackerResponse(format!("invalid tracker url {url}")));
        }
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let (tx, rx) = mpsc::channel(16);

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_owned(),
            peer_id,
            swarm_id,
            ip,
            port,
            tx,
            rx,
        })
    }

    pub fn announce_url(&self, event: Event) -> String {
        format!(
            "{}/announce?peerId={}&swarmId={}&ip={}&port={}&event={}",
            self.url,
            urlencoding::encode(&self.peer_id.to_string()),
            self.swarm_id,
            urlencoding::encode(&self.ip.to_string()),
            self.port,
            event,
        )
    }

    /// Send one announce and return the body of the response.
    #[tracing::instrument(skip(self))]
    pub async fn announce(&self, event: Event) -> Result<bytes::Bytes, Error> {
        let url = self.announce_url(event);
        debug!("requesting {url}");

        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            return Err(Error::TrackerResponse(format!(
                "{event} announce answered with {}",
                res.status()
            )));
        }
        Ok(res.bytes().await?)
    }

    /// Join the swarm and get the peers already in it.
    pub async fn announce_started(&self) -> Result<Swarm, Error> {
        let body = self.announce(Event::Started).await?;
        let swarm: Swarm = serde_json::from_slice(&body)?;

        if swarm.id_hash != self.swarm_id.to_string() {
            warn!("tracker answered for swarm {} instead of {}", swarm.id_hash, self.swarm_id);
        }
        info!(
            "tracker knows {} peers",
            swarm.peers.as_ref().map(|p| p.len()).unwrap_or(0)
        );
        Ok(swarm)
    }

    /// Keep our membership alive until we complete or stop.
    #[tracing::instrument(skip_all, name = "tracker")]
    pub async fn run(mut self) {
        let mut keepalive =
            interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);

        loop {
            select! {
                _ = keepalive.tick() => {
                    if let Err(e) = self.announce(Event::Alive).await {
                        warn!("keep alive failed: {e}");
                    }
                }
                msg = self.rx.recv() => {
                    let Some(TrackerMsg::Announce { event, recipient }) = msg else {
                        return;
                    };
                    if let Err(e) = self.announce(event).await {
                        warn!("{event} announce failed: {e}");
                    }
                    if let Some(recipient) = recipient {
                        let _ = recipient.send(());
                    }
                    if matches!(event, Event::Completed | Event::Stopped) {
                        debug!("left the swarm");
                        return;
                    }
                }
            }
        }
    }
}
