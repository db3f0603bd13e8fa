//! Realtime channel client.
//!
//! One task owns the [`LivenessTracker`] and feeds it from a single `select!`
//! loop: websocket frames, the polling tick and the fit deadline. Tracker
//! events are forwarded over an mpsc channel; dropping the receiver ends the
//! session. With a snapshot path set, tracker state is restored on start and
//! saved on ticks that follow a change and once more on exit.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::snapshot::ViewerSnapshot;
use super::tracker::{LivenessTracker, TrackerEvent, TrackerSettings};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::wire::RealtimeEvent;

/// Delays before successive reconnect attempts; the last one repeats.
pub const RECONNECT_DELAYS: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Delay before reconnect attempt number `attempt` (0-based).
#[must_use]
pub fn reconnect_delay(attempt: usize) -> Duration {
    RECONNECT_DELAYS[attempt.min(RECONNECT_DELAYS.len() - 1)]
}

/// A viewer connected to the realtime channel.
#[derive(Debug)]
pub struct ViewerSession {
    url: String,
    tracker: LivenessTracker,
    tick_interval: Duration,
    snapshot_path: Option<PathBuf>,
    restore: bool,
    dirty: bool,
}

impl ViewerSession {
    /// Create a session for `url` (a `ws://` or `wss://` endpoint).
    pub fn new(url: impl Into<String>, settings: TrackerSettings, tick_interval: Duration) -> Self {
        Self {
            url: url.into(),
            tracker: LivenessTracker::new(settings),
            tick_interval,
            snapshot_path: None,
            restore: true,
            dirty: false,
        }
    }

    /// Create a session from the `[viewer]` configuration section.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.viewer.hub_url.clone(),
            TrackerSettings::from_config(config),
            config.tick_interval(),
        )
        .with_snapshot(config.viewer_snapshot_path())
    }

    /// Persist tracker state at `path`.
    #[must_use]
    pub fn with_snapshot(mut self, path: Option<PathBuf>) -> Self {
        self.snapshot_path = path;
        self
    }

    /// Whether to load the saved state on start. Saving is unaffected.
    #[must_use]
    pub fn with_restore(mut self, restore: bool) -> Self {
        self.restore = restore;
        self
    }

    /// Run on a new task.
    pub fn spawn(self, events: mpsc::Sender<TrackerEvent>) -> SessionTask {
        SessionTask {
            handle: tokio::spawn(self.run(events)),
        }
    }

    /// The endpoint this session connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run until `events` is closed, reconnecting whenever the channel drops.
    ///
    /// Ticks keep running while disconnected so silent devices still age out.
    pub async fn run(mut self, events: mpsc::Sender<TrackerEvent>) {
        if !self.load_snapshot(&events).await {
            return;
        }
        self.run_channel(&events).await;
        self.save_snapshot().await;
    }

    async fn run_channel(&mut self, events: &mpsc::Sender<TrackerEvent>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut attempt = 0usize;

        loop {
            let delay = reconnect_delay(attempt);
            if !delay.is_zero() {
                debug!(
                    url = %self.url,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Waiting before reconnect"
                );
            }
            let wait = tokio::time::sleep(delay);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    () = &mut wait => break,
                    () = events.closed() => return,
                    _ = ticker.tick() => {
                        if self.dirty {
                            self.save_snapshot().await;
                        }
                        let batch = self.tracker.tick(Utc::now());
                        if !self.forward(events, batch).await {
                            return;
                        }
                    }
                }
            }

            match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await {
                Ok(Ok((ws, _))) => {
                    info!(url = %self.url, "Connected to realtime channel");
                    attempt = 0;
                    if !self.pump(ws, &mut ticker, events).await {
                        return;
                    }
                    warn!(url = %self.url, "Realtime channel closed");
                }
                Ok(Err(e)) => {
                    attempt += 1;
                    warn!(url = %self.url, attempt, error = %e, "Realtime connect failed");
                }
                Err(_) => {
                    attempt += 1;
                    warn!(url = %self.url, attempt, "Realtime connect timed out");
                }
            }
        }
    }

    /// Process one connection. Returns `false` once `events` is closed.
    async fn pump(
        &mut self,
        mut ws: WsStream,
        ticker: &mut Interval,
        events: &mpsc::Sender<TrackerEvent>,
    ) -> bool {
        loop {
            let batch = tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RealtimeEvent>(&text) {
                        Ok(RealtimeEvent::LocationUpdate(update)) => {
                            self.tracker.apply(update, Utc::now())
                        }
                        Ok(RealtimeEvent::Connected(greeting)) => {
                            debug!(connection_id = %greeting.connection_id, "Realtime greeting");
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed realtime frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return true,
                    Some(Err(e)) => {
                        warn!(error = %e, "Realtime channel error");
                        return true;
                    }
                    Some(Ok(_)) => continue,
                },
                () = events.closed() => return false,
                _ = ticker.tick() => {
                    if self.dirty {
                        self.save_snapshot().await;
                    }
                    self.tracker.tick(Utc::now())
                }
                () = fit_due(self.tracker.fit_deadline()) => self.tracker.tick(Utc::now()),
            };
            if !self.forward(events, batch).await {
                return false;
            }
        }
    }

    /// Restore saved state. Returns `false` once `events` is closed.
    async fn load_snapshot(&mut self, events: &mpsc::Sender<TrackerEvent>) -> bool {
        let Some(path) = self.snapshot_path.as_deref().filter(|_| self.restore) else {
            return true;
        };
        let batch = match ViewerSnapshot::load(path).await {
            Ok(Some(snapshot)) => self.tracker.restore(snapshot, Utc::now()),
            Ok(None) => return true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable viewer snapshot");
                return true;
            }
        };
        self.forward(events, batch).await
    }

    async fn save_snapshot(&mut self) {
        let Some(path) = self.snapshot_path.as_deref() else {
            return;
        };
        match self.tracker.snapshot().save(path).await {
            Ok(()) => self.dirty = false,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to save viewer snapshot"),
        }
    }

    async fn forward(&mut self, events: &mpsc::Sender<TrackerEvent>, batch: Vec<TrackerEvent>) -> bool {
        if !batch.is_empty() {
            self.dirty = true;
        }
        for event in batch {
            if events.send(event).await.is_err() {
                return false;
            }
        }
        true
    }
}

/// A [`ViewerSession`] running on its own task.
#[derive(Debug)]
pub struct SessionTask {
    handle: JoinHandle<()>,
}

impl SessionTask {
    /// Whether the session has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the session to end.
    ///
    /// # Errors
    ///
    /// Returns an error if the session task panicked or was cancelled.
    pub async fn finish(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| Error::realtime(format!("viewer session failed: {e}")))
    }
}

async fn fit_due(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => {
            let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
        }
        None => std::future::pending().await,
    }
}
