//! Core telemetry types for trackline.
//!
//! This module defines the position sample shapes that flow through the
//! pipeline: raw fixes from the location source, the device identity that
//! stamps them, and the canonical [`TelemetryRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mean Earth radius in meters (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A raw position fix as produced by the location source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionFix {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Horizontal accuracy radius in meters.
    #[serde(default)]
    pub accuracy: f64,
    /// When the fix was captured.
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
}

impl PositionFix {
    /// Create a fix captured now.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            captured_at: Utc::now(),
        }
    }

    /// Great-circle distance to another fix in meters (haversine).
    #[must_use]
    pub fn distance_to(&self, other: &PositionFix) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// Who a device reports as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device identifier, bound to the bearer credential server-side.
    pub device_id: String,
    /// Display name of the person carrying the device.
    pub user_name: String,
    /// Free-form label for the device.
    pub title: String,
}

/// One timestamped position sample.
///
/// `is_offline` is decided once by the submitter when the record is created
/// and is never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Client-generated identifier (UUIDv7, so it sorts by creation time).
    pub id: Uuid,
    /// Reporting device.
    pub device_id: String,
    /// Device label.
    pub title: Option<String>,
    /// Carrier display name.
    pub user_name: Option<String>,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// When the position was captured.
    pub recorded_at: DateTime<Utc>,
    /// Whether the record was captured while it could not be sent live.
    pub is_offline: bool,
}

impl TelemetryRecord {
    /// Build a record for a fix that passed the movement filter.
    #[must_use]
    pub fn from_fix(identity: &DeviceIdentity, fix: &PositionFix, is_offline: bool) -> Self {
        Self {
            id: Uuid::now_v7(),
            device_id: identity.device_id.clone(),
            title: Some(identity.title.clone()),
            user_name: Some(identity.user_name.clone()),
            latitude: fix.latitude,
            longitude: fix.longitude,
            recorded_at: fix.captured_at,
            is_offline,
        }
    }
}
