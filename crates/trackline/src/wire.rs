//! Wire contracts shared by the device, server, and viewer.
//!
//! All payloads use camelCase field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::TelemetryRecord;

/// Body of `POST /telemetry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Carrier display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Device label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Capture time; the server assigns its own clock when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_timestamp: Option<DateTime<Utc>>,
    /// Whether the record was captured while offline.
    #[serde(default)]
    pub is_offline: bool,
    /// Client-generated record id used to drop resubmissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_record_id: Option<Uuid>,
}

impl IngestRequest {
    /// Build the request body for a record.
    #[must_use]
    pub fn from_record(record: &TelemetryRecord) -> Self {
        Self {
            latitude: record.latitude,
            longitude: record.longitude,
            user_name: record.user_name.clone(),
            title: record.title.clone(),
            record_timestamp: Some(record.recorded_at),
            is_offline: record.is_offline,
            client_record_id: Some(record.id),
        }
    }

    /// Check coordinate sanity beyond what deserialization enforces.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(format!("latitude out of range: {}", self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(format!("longitude out of range: {}", self.longitude));
        }
        Ok(())
    }
}

/// Response body of `POST /telemetry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Human-readable outcome.
    pub message: String,
    /// Server-assigned record identifier.
    pub id: String,
}

/// Reduced projection of a record published to live viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeUpdate {
    /// Reporting device.
    pub device_id: String,
    /// Carrier display name (empty when unknown).
    pub user_name: String,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Capture time of the position.
    pub timestamp: DateTime<Utc>,
}

/// Greeting sent to a subscriber right after it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedGreeting {
    /// Identifier of this realtime connection.
    pub connection_id: Uuid,
    /// Server time of the connection.
    pub connected_at: DateTime<Utc>,
}

/// A frame on the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RealtimeEvent {
    /// Connection acknowledged.
    Connected(ConnectedGreeting),
    /// A device reported a fresh position.
    LocationUpdate(RealtimeUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeviceIdentity, PositionFix};

    #[test]
    fn test_ingest_request_minimal_body() {
        let req: IngestRequest =
            serde_json::from_str(r#"{"latitude": 10.0, "longitude": 106.0}"#).unwrap();
        assert!(!req.is_offline);
        assert!(req.record_timestamp.is_none());
        assert!(req.client_record_id.is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_ingest_request_missing_latitude_fails() {
        let result = serde_json::from_str::<IngestRequest>(r#"{"longitude": 106.0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_ingest_request_out_of_range() {
        let req: IngestRequest =
            serde_json::from_str(r#"{"latitude": 91.0, "longitude": 0.0}"#).unwrap();
        assert!(req.validate().unwrap_err().contains("latitude"));

        let req: IngestRequest =
            serde_json::from_str(r#"{"latitude": 0.0, "longitude": -181.0}"#).unwrap();
        assert!(req.validate().unwrap_err().contains("longitude"));
    }

    #[test]
    fn test_ingest_request_from_record_uses_camel_case() {
        let identity = DeviceIdentity {
            device_id: "dev-9".to_string(),
            user_name: "bob".to_string(),
            title: "truck".to_string(),
        };
        let record = TelemetryRecord::from_fix(&identity, &PositionFix::new(1.0, 2.0, 3.0), true);
        let json = serde_json::to_value(IngestRequest::from_record(&record)).unwrap();

        assert_eq!(json["isOffline"], true);
        assert_eq!(json["userName"], "bob");
        assert_eq!(json["clientRecordId"], record.id.to_string());
        assert!(json.get("recordTimestamp").is_some());
    }

    #[test]
    fn test_realtime_event_envelope() {
        let event = RealtimeEvent::LocationUpdate(RealtimeUpdate {
            device_id: "dev-1".to_string(),
            user_name: "alice".to_string(),
            latitude: 1.0,
            longitude: 2.0,
            timestamp: DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "LocationUpdate");
        assert_eq!(json["data"]["deviceId"], "dev-1");
        assert_eq!(json["data"]["timestamp"], "2025-03-01T10:00:00Z");

        let back: RealtimeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
