//! Realtime fanout to connected viewers.
//!
//! A thin wrapper over a tokio broadcast channel. Delivery is at-most-once:
//! a subscriber only sees events published after it subscribed, and a
//! subscriber that falls behind the channel capacity skips the overflow.

use tokio::sync::broadcast;
use tracing::trace;

use crate::wire::{RealtimeEvent, RealtimeUpdate};

/// Broadcasts realtime updates to every subscriber.
#[derive(Debug, Clone)]
pub struct RealtimeFanout {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl RealtimeFanout {
    /// Create a fanout buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an update; returns how many subscribers it reached.
    ///
    /// Zero subscribers is not an error.
    pub fn publish(&self, update: RealtimeUpdate) -> usize {
        let device_id = update.device_id.clone();
        let reached = self
            .tx
            .send(RealtimeEvent::LocationUpdate(update))
            .unwrap_or(0);
        trace!(%device_id, reached, "Published location update");
        reached
    }

    /// Subscribe to future updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
