//! Send-now versus queue decision for freshly captured fixes.
//!
//! [`MovementGate`] turns raw fixes into records, dropping those that are too
//! close to the last transmitted position. [`TelemetrySubmitter`] then tries a
//! live send and falls back to the offline queue.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use super::credentials::CredentialStore;
use super::queue::OfflineQueue;
use super::transport::{deliver_with_retry, DeliveryError, RetryPolicy, TelemetryTransport};
use crate::record::{DeviceIdentity, PositionFix, TelemetryRecord};

/// Minimum-movement filter.
///
/// A fix passes when it is the first of the session, or when it lies at least
/// `max(min_distance_m, accuracy_factor * accuracy)` meters from the last fix
/// that passed.
#[derive(Debug, Clone)]
pub struct MovementFilter {
    min_distance_m: f64,
    accuracy_factor: f64,
    last_sent: Option<PositionFix>,
}

impl MovementFilter {
    /// Create a filter with the given constants.
    #[must_use]
    pub fn new(min_distance_m: f64, accuracy_factor: f64) -> Self {
        Self {
            min_distance_m,
            accuracy_factor,
            last_sent: None,
        }
    }

    /// Distance a fix must cover to pass.
    #[must_use]
    pub fn threshold(&self, fix: &PositionFix) -> f64 {
        self.min_distance_m.max(self.accuracy_factor * fix.accuracy)
    }

    /// Decide whether a fix is transmitted, remembering it if so.
    pub fn admit(&mut self, fix: &PositionFix) -> bool {
        let accepted = match &self.last_sent {
            None => true,
            Some(last) => last.distance_to(fix) >= self.threshold(fix),
        };
        if accepted {
            self.last_sent = Some(*fix);
        }
        accepted
    }

    /// The last fix that passed the filter.
    #[must_use]
    pub fn last_sent(&self) -> Option<&PositionFix> {
        self.last_sent.as_ref()
    }
}

impl Default for MovementFilter {
    fn default() -> Self {
        Self::new(20.0, 2.0)
    }
}

/// Stamps admitted fixes with the device identity.
#[derive(Debug, Clone)]
pub struct MovementGate {
    identity: DeviceIdentity,
    filter: MovementFilter,
}

impl MovementGate {
    /// Create a gate for one tracking session.
    #[must_use]
    pub fn new(identity: DeviceIdentity, filter: MovementFilter) -> Self {
        Self { identity, filter }
    }

    /// Turn a fix into a record, or `None` if the device has not moved enough.
    pub fn admit(&mut self, fix: &PositionFix) -> Option<TelemetryRecord> {
        if self.filter.admit(fix) {
            Some(TelemetryRecord::from_fix(&self.identity, fix, false))
        } else {
            debug!(
                latitude = fix.latitude,
                longitude = fix.longitude,
                "Fix below movement threshold, dropped"
            );
            None
        }
    }

    /// The identity stamped on records.
    #[must_use]
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }
}

/// Why a record went to the offline queue instead of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueReason {
    /// No credential was available.
    AuthMissing,
    /// All live delivery attempts failed.
    DeliveryFailed,
    /// The send lane was full.
    Backpressure,
}

impl fmt::Display for QueueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthMissing => write!(f, "auth-missing"),
            Self::DeliveryFailed => write!(f, "delivery-failed"),
            Self::Backpressure => write!(f, "backpressure"),
        }
    }
}

/// What happened to a submitted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Delivered live.
    Sent {
        /// Identifier assigned by the server.
        server_id: String,
    },
    /// Persisted in the offline queue.
    Queued {
        /// Local queue id.
        local_id: i64,
        /// Why it was queued.
        reason: QueueReason,
    },
    /// Neither sent nor queued; the record is lost.
    Dropped {
        /// The queue write error.
        error: String,
    },
}

/// Live-send path with offline fallback.
#[derive(Debug)]
pub struct TelemetrySubmitter<T: ?Sized> {
    credentials: Arc<CredentialStore>,
    transport: Arc<T>,
    queue: Arc<OfflineQueue>,
    policy: RetryPolicy,
}

impl<T> TelemetrySubmitter<T>
where
    T: TelemetryTransport + ?Sized,
{
    /// Create a submitter.
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
        }
    }

    /// Send a record now, or queue it as offline.
    ///
    /// Without a credential no request is made. After the retry budget is
    /// spent the record is queued. Never returns an error: the worst case is
    /// [`SubmitOutcome::Dropped`] when the queue itself cannot be written.
    pub async fn submit(&self, record: TelemetryRecord) -> SubmitOutcome {
        let Some(credential) = self.credentials.bearer() else {
            return self.enqueue_offline(record, QueueReason::AuthMissing).await;
        };

        match deliver_with_retry(self.transport.as_ref(), &record, &credential, &self.policy).await
        {
            Ok(receipt) => {
                debug!(record_id = %record.id, server_id = %receipt.id, "Record sent live");
                SubmitOutcome::Sent {
                    server_id: receipt.id,
                }
            }
            Err(DeliveryError::AuthMissing) => {
                self.enqueue_offline(record, QueueReason::AuthMissing).await
            }
            Err(err) => {
                info!(record_id = %record.id, error = %err, "Live send failed, queueing offline");
                self.enqueue_offline(record, QueueReason::DeliveryFailed).await
            }
        }
    }

    /// Mark a record offline and persist it in the queue.
    ///
    /// The write runs on the blocking pool.
    pub async fn enqueue_offline(&self, record: TelemetryRecord, reason: QueueReason) -> SubmitOutcome {
        let record = TelemetryRecord {
            is_offline: true,
            ..record
        };
        let record_id = record.id;

        match self.queue.blocking(move |queue| queue.enqueue(&record)).await {
            Ok(local_id) => {
                debug!(local_id, %record_id, %reason, "Record queued offline");
                SubmitOutcome::Queued { local_id, reason }
            }
            Err(e) => {
                error!(%record_id, %reason, "Failed to queue record, it is lost: {}", e);
                SubmitOutcome::Dropped {
                    error: e.to_string(),
                }
            }
        }
    }

    /// The offline queue records fall back to.
    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }
}
