//! Device side of the pipeline.
//!
//! Fixes enter through [`DeviceRuntime`], pass the movement filter in
//! [`MovementGate`], and are either sent live by [`TelemetrySubmitter`] or
//! parked in the [`OfflineQueue`] until [`DeliveryAgent`] drains them.

pub mod agent;
pub mod credentials;
pub mod queue;
pub mod runtime;
pub mod submitter;
pub mod transport;

pub use agent::{DeliveryAgent, DrainOutcome, DrainReport, DrainTrigger};
pub use credentials::CredentialStore;
pub use queue::{OfflineQueue, QueueEntry, QueueStats};
pub use runtime::{ConnectivityMonitor, DeviceRuntime, NoopPolicy, PolicyEnforcer, RuntimeSettings};
pub use submitter::{MovementFilter, MovementGate, QueueReason, SubmitOutcome, TelemetrySubmitter};
pub use transport::{deliver_with_retry, DeliveryError, HttpTransport, RetryPolicy, TelemetryTransport};
