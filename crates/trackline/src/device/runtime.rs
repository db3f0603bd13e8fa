//! Device telemetry lifecycle.
//!
//! [`DeviceRuntime`] wires the submitter, the offline queue and the delivery
//! agent into independent lanes:
//!
//! - capture: filters incoming fixes and hands records to the send lane
//!   without ever waiting on the network
//! - send: delivers records one at a time, queueing those that fail
//! - connectivity: drains when the network comes back
//! - periodic: drains on a schedule while online
//! - startup: one drain when the runtime starts
//!
//! Host platform hooks (service start, boot, network callbacks) map onto
//! [`DeviceRuntime::drive`] and [`ConnectivityMonitor::set_online`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::agent::{DeliveryAgent, DrainReport, DrainTrigger};
use super::credentials::CredentialStore;
use super::queue::OfflineQueue;
use super::submitter::{MovementFilter, MovementGate, QueueReason, TelemetrySubmitter};
use super::transport::{RetryPolicy, TelemetryTransport};
use crate::config::Config;
use crate::error::Result;
use crate::record::{DeviceIdentity, PositionFix};

/// Host-platform lockdown hook run once before tracking starts.
pub trait PolicyEnforcer: Send + Sync {
    /// Apply device policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy could not be applied. The runtime logs
    /// it and starts anyway.
    fn apply_at_startup(&self) -> Result<()>;
}

/// Policy enforcer for hosts without device management.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPolicy;

impl PolicyEnforcer for NoopPolicy {
    fn apply_at_startup(&self) -> Result<()> {
        Ok(())
    }
}

/// Network availability as reported by the host.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the given initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Report the current network state.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    /// Whether the network is currently available.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Tunables for the device lanes.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Minimum movement in meters.
    pub min_distance_m: f64,
    /// Accuracy multiplier for the movement threshold.
    pub accuracy_factor: f64,
    /// Capacity of the capture-to-send channel.
    pub send_buffer: usize,
    /// Retry policy for live sends.
    pub live_policy: RetryPolicy,
    /// Retry policy for drains.
    pub drain_policy: RetryPolicy,
    /// Interval of the periodic drain.
    pub drain_interval: Duration,
    /// Delay before the first periodic drain.
    pub drain_initial_delay: Duration,
}

impl RuntimeSettings {
    /// Derive settings from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_distance_m: config.device.min_distance_m,
            accuracy_factor: config.device.accuracy_factor,
            send_buffer: config.device.send_buffer,
            live_policy: RetryPolicy::live(config.delivery.max_attempts, config.live_backoff()),
            drain_policy: RetryPolicy::drain(
                config.delivery.max_attempts,
                config.drain_backoff(),
                config.throttle(),
            ),
            drain_interval: config.drain_interval(),
            drain_initial_delay: config.drain_initial_delay(),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A running device lifecycle.
#[derive(Debug)]
pub struct DeviceRuntime<T: ?Sized> {
    fixes: Option<mpsc::Sender<PositionFix>>,
    agent: Arc<DeliveryAgent<T>>,
    submitter: Arc<TelemetrySubmitter<T>>,
    connectivity: ConnectivityMonitor,
    tasks: Vec<JoinHandle<()>>,
}

impl<T> DeviceRuntime<T>
where
    T: TelemetryTransport + ?Sized + 'static,
{
    /// Start all lanes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        identity: DeviceIdentity,
        settings: &RuntimeSettings,
        credentials: Arc<CredentialStore>,
        transport: Arc<T>,
        queue: Arc<OfflineQueue>,
        connectivity: ConnectivityMonitor,
        policy: &dyn PolicyEnforcer,
    ) -> Self {
        if let Err(e) = policy.apply_at_startup() {
            warn!("Device policy not applied: {}", e);
        }

        let submitter = Arc::new(TelemetrySubmitter::new(
            Arc::clone(&credentials),
            Arc::clone(&transport),
            Arc::clone(&queue),
            settings.live_policy,
        ));
        let agent = Arc::new(DeliveryAgent::new(
            credentials,
            transport,
            queue,
            settings.drain_policy,
        ));

        let (fix_tx, fix_rx) = mpsc::channel(settings.send_buffer);
        let (send_tx, send_rx) = mpsc::channel(settings.send_buffer);
        let gate = MovementGate::new(
            identity,
            MovementFilter::new(settings.min_distance_m, settings.accuracy_factor),
        );

        info!(device_id = %gate.identity().device_id, "Starting device runtime");

        let tasks = vec![
            tokio::spawn(capture_lane(gate, fix_rx, send_tx, Arc::clone(&submitter))),
            tokio::spawn(send_lane(send_rx, Arc::clone(&submitter))),
            tokio::spawn(connectivity_lane(
                connectivity.subscribe(),
                Arc::clone(&agent),
            )),
            tokio::spawn(Arc::clone(&agent).run_periodic(
                settings.drain_interval,
                settings.drain_initial_delay,
                connectivity.subscribe(),
            )),
            tokio::spawn({
                let agent = Arc::clone(&agent);
                async move {
                    agent.drain(DrainTrigger::Startup).await;
                }
            }),
        ];

        Self {
            fixes: Some(fix_tx),
            agent,
            submitter,
            connectivity,
            tasks,
        }
    }

    /// Sender for raw position fixes.
    ///
    /// Returns `None` after [`stop`](Self::stop).
    #[must_use]
    pub fn fix_sender(&self) -> Option<mpsc::Sender<PositionFix>> {
        self.fixes.clone()
    }

    /// Run a drain now on behalf of an external trigger.
    pub async fn drive(&self, trigger: DrainTrigger) -> DrainReport {
        self.agent.drain(trigger).await
    }

    /// Connectivity handle for host callbacks.
    #[must_use]
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// The delivery agent.
    #[must_use]
    pub fn agent(&self) -> &Arc<DeliveryAgent<T>> {
        &self.agent
    }

    /// The offline queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        self.submitter.queue()
    }

    /// Cancel all lanes, including any scheduled or in-flight drain.
    pub fn stop(&mut self) {
        self.fixes = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Device runtime stopped");
    }

    /// Stop accepting fixes and wait for the capture and send lanes to flush.
    ///
    /// Drain lanes are cancelled.
    pub async fn shutdown(mut self) {
        self.fixes = None;
        let mut tasks = self.tasks.drain(..);
        let capture = tasks.next();
        let send = tasks.next();
        for task in tasks {
            task.abort();
        }
        for task in [capture, send].into_iter().flatten() {
            let _ = task.await;
        }
        info!("Device runtime shut down");
    }
}

impl<T: ?Sized> Drop for DeviceRuntime<T> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn capture_lane<T>(
    mut gate: MovementGate,
    mut fixes: mpsc::Receiver<PositionFix>,
    send: mpsc::Sender<crate::record::TelemetryRecord>,
    submitter: Arc<TelemetrySubmitter<T>>,
) where
    T: TelemetryTransport + ?Sized,
{
    while let Some(fix) = fixes.recv().await {
        let Some(record) = gate.admit(&fix) else {
            continue;
        };
        match send.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                debug!(record_id = %record.id, "Send lane full");
                submitter.enqueue_offline(record, QueueReason::Backpressure).await;
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                submitter.enqueue_offline(record, QueueReason::Backpressure).await;
                break;
            }
        }
    }
    debug!("Capture lane finished");
}

async fn send_lane<T>(
    mut records: mpsc::Receiver<crate::record::TelemetryRecord>,
    submitter: Arc<TelemetrySubmitter<T>>,
) where
    T: TelemetryTransport + ?Sized,
{
    while let Some(record) = records.recv().await {
        submitter.submit(record).await;
    }
    debug!("Send lane finished");
}

async fn connectivity_lane<T>(mut rx: watch::Receiver<bool>, agent: Arc<DeliveryAgent<T>>)
where
    T: TelemetryTransport + ?Sized,
{
    let mut was_online = *rx.borrow_and_update();
    while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if online && !was_online {
            info!("Connectivity restored");
            agent.drain(DrainTrigger::ConnectivityRestored).await;
        }
        was_online = online;
    }
}
