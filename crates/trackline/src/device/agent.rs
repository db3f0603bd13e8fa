//! Queue draining.
//!
//! A drain walks the offline queue oldest first, delivers each entry with
//! bounded retries, and removes only the entries the server confirmed. One
//! failing entry does not block the ones after it. Drains are mutually
//! exclusive: a trigger that arrives while a drain is running is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::credentials::CredentialStore;
use super::queue::OfflineQueue;
use super::transport::{deliver_with_retry, RetryPolicy, TelemetryTransport};

/// What started a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    /// Process start.
    Startup,
    /// Connectivity went from unavailable to available.
    ConnectivityRestored,
    /// The periodic scheduler fired.
    Periodic,
    /// An operator or host asked for it.
    Manual,
}

impl fmt::Display for DrainTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => write!(f, "startup"),
            Self::ConnectivityRestored => write!(f, "connectivity-restored"),
            Self::Periodic => write!(f, "periodic"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every snapshotted entry was attempted.
    Completed,
    /// Another drain held the guard; nothing was done.
    AlreadyRunning,
    /// No credential; nothing was sent and all entries stay queued.
    NoCredential,
    /// The queue could not be read.
    QueueUnavailable,
}

/// Result of one drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// What started the drain.
    pub trigger: DrainTrigger,
    /// How it ended.
    pub outcome: DrainOutcome,
    /// Entries attempted.
    pub attempted: usize,
    /// Entries confirmed by the server.
    pub delivered: usize,
    /// Entries left in the queue after exhausting their retries.
    pub failed: usize,
}

impl DrainReport {
    fn empty(trigger: DrainTrigger, outcome: DrainOutcome) -> Self {
        Self {
            trigger,
            outcome,
            attempted: 0,
            delivered: 0,
            failed: 0,
        }
    }
}

/// Releases the in-flight flag on every exit path, including cancellation.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Drains the offline queue.
#[derive(Debug)]
pub struct DeliveryAgent<T: ?Sized> {
    credentials: Arc<CredentialStore>,
    transport: Arc<T>,
    queue: Arc<OfflineQueue>,
    policy: RetryPolicy,
    draining: AtomicBool,
}

impl<T> DeliveryAgent<T>
where
    T: TelemetryTransport + ?Sized,
{
    /// Create an agent.
    #[must_use]
    pub fn new(
        credentials: Arc<CredentialStore>,
        transport: Arc<T>,
        queue: Arc<OfflineQueue>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            credentials,
            transport,
            queue,
            policy,
            draining: AtomicBool::new(false),
        }
    }

    /// Whether a drain is in flight.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Attempt delivery of every queued entry.
    pub async fn drain(&self, trigger: DrainTrigger) -> DrainReport {
        let Some(_guard) = DrainGuard::try_acquire(&self.draining) else {
            debug!(%trigger, "Drain already running, trigger ignored");
            return DrainReport::empty(trigger, DrainOutcome::AlreadyRunning);
        };

        let Some(credential) = self.credentials.bearer() else {
            debug!(%trigger, "No credential, drain skipped");
            return DrainReport::empty(trigger, DrainOutcome::NoCredential);
        };

        let pending = match self.queue.blocking(OfflineQueue::list_pending).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(%trigger, "Failed to read offline queue: {}", e);
                return DrainReport::empty(trigger, DrainOutcome::QueueUnavailable);
            }
        };

        if pending.is_empty() {
            debug!(%trigger, "Offline queue empty");
            return DrainReport::empty(trigger, DrainOutcome::Completed);
        }

        info!(%trigger, pending = pending.len(), "Draining offline queue");
        let mut report = DrainReport::empty(trigger, DrainOutcome::Completed);

        for (index, entry) in pending.iter().enumerate() {
            if index > 0 && !self.policy.throttle.is_zero() {
                tokio::time::sleep(self.policy.throttle).await;
            }

            report.attempted += 1;
            let record = entry.to_record();
            match deliver_with_retry(self.transport.as_ref(), &record, &credential, &self.policy)
                .await
            {
                Ok(_) => {
                    report.delivered += 1;
                    let local_id = entry.local_id;
                    match self.queue.blocking(move |q| q.remove_by_id(local_id)).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(local_id = entry.local_id, "Delivered entry already gone");
                        }
                        Err(e) => {
                            // The entry stays and is resent next drain.
                            error!(local_id = entry.local_id, "Failed to remove delivered entry: {}", e);
                        }
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(local_id = entry.local_id, error = %err, "Entry left in queue");
                }
            }
        }

        info!(
            %trigger,
            delivered = report.delivered,
            failed = report.failed,
            "Drain finished"
        );
        report
    }

    /// Drain on a fixed schedule while connectivity is available.
    ///
    /// The first tick fires after `initial_delay`. Ticks that find the device
    /// offline are skipped. Runs until the connectivity sender is dropped.
    pub async fn run_periodic(
        self: Arc<Self>,
        period: Duration,
        initial_delay: Duration,
        mut connectivity: watch::Receiver<bool>,
    ) {
        let mut ticker = interval_at(Instant::now() + initial_delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if connectivity.has_changed().is_err() {
                debug!("Connectivity source gone, periodic drain stopped");
                return;
            }
            let online = *connectivity.borrow_and_update();
            if !online {
                debug!("Offline, periodic drain skipped");
                continue;
            }
            self.drain(DrainTrigger::Periodic).await;
        }
    }
}
