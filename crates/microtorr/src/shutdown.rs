//! Process-wide termination barrier.
//!
//! Whichever path reaches a terminal state first (download completed, a fatal
//! error, or a termination signal) releases the barrier. Later releases are
//! ignored, so the reason reported to the coordinator is always the first one.
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::Error,
    tracker::{notify_tracker, Event, TrackerMsg},
};

/// Why the client stopped.
#[derive(Debug)]
pub enum Exit {
    /// Every piece was downloaded, verified and written.
    Completed,
    /// A termination signal was received.
    Interrupted,
    Failed(Error),
}

#[derive(Debug, Default)]
pub struct Shutdown {
    token: CancellationToken,
    exit: Mutex<Option<Exit>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the barrier. Returns false if it was already released.
    pub async fn release(&self, exit: Exit) -> bool {
        let mut current = self.exit.lock().await;
        if self.token.is_cancelled() {
            return false;
        }
        *current = Some(exit);
        self.token.cancel();
        true
    }

    /// Release with a failure. Errors raised after the barrier was already
    /// released are only logged at debug level.
    pub async fn fail(&self, err: Error) -> bool {
        let reason = err.to_string();
        let released = self.release(Exit::Failed(err)).await;
        if released {
            error!("{reason}");
        } else {
            debug!("ignoring failure after shutdown: {reason}");
        }
        released
    }

    pub fn is_released(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancelled when the barrier is released. Tasks derive child tokens
    /// from it to stop their loops.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Block until the barrier is released and take the exit reason.
    pub async fn wait(&self) -> Exit {
        self.token.cancelled().await;
        self.exit.lock().await.take().unwrap_or(Exit::Interrupted)
    }
}

/// Wait for SIGINT or SIGTERM. On signal, tell the tracker we are leaving,
/// wait for its acknowledgement and release the barrier.
pub async fn listen_for_signals(
    shutdown: Arc<Shutdown>,
    tracker_tx: Option<mpsc::Sender<TrackerMsg>>,
) {
    tokio::select! {
        _ = terminate() => {}
        _ = shutdown.token().cancelled() => return,
    }

    warn!("received a termination signal, leaving the swarm");
    notify_tracker(tracker_tx.as_ref(), Event::Stopped).await;

    if shutdown.release(Exit::Interrupted).await {
        info!("stopped");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("could not listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn terminate() {
    let _ = tokio::signal::ctrl_c().await;
}
