//! `trackline` - Offline-tolerant device position telemetry
//!
//! Devices capture position fixes, drop the ones that did not move far
//! enough, and send the rest to an ingestion server. Anything that cannot be
//! sent is parked in a durable local queue and drained later. The server
//! stores every record and forwards live ones to connected viewers, which
//! track each device's liveness from the age of its last point.
//!
//! - [`device`]: capture, movement filter, live delivery, offline queue, drains
//! - [`server`]: authenticated ingestion, history store, realtime fanout
//! - [`viewer`]: realtime client and liveness state machine

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod record;
pub mod server;
pub mod storage;
pub mod viewer;
pub mod wire;

pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use record::{DeviceIdentity, PositionFix, TelemetryRecord};
pub use wire::{IngestRequest, IngestResponse, RealtimeEvent, RealtimeUpdate};
