//! Ingestion decision: persist always, broadcast only live records.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::auth::AuthError;
use super::fanout::RealtimeFanout;
use super::store::{InsertOutcome, StoredRecord, TelemetryStore};
use crate::wire::{IngestRequest, IngestResponse, RealtimeUpdate};

/// Response message for records stored but not broadcast.
pub const MSG_OFFLINE: &str = "Inserted offline data (no realtime broadcast)";

/// Response message for records stored and broadcast.
pub const MSG_REALTIME: &str = "Inserted & broadcasted realtime successfully";

/// Response message for resubmitted records.
pub const MSG_DUPLICATE: &str = "Duplicate record ignored";

/// Why an ingestion request was refused.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The caller could not be authenticated.
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    /// The body failed schema validation.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Persisting the record failed.
    #[error("storage failure: {0}")]
    Storage(#[from] crate::error::Error),
}

/// Accepts authenticated records.
#[derive(Debug, Clone)]
pub struct IngestionEndpoint {
    store: Arc<TelemetryStore>,
    fanout: RealtimeFanout,
}

impl IngestionEndpoint {
    /// Create an endpoint over a store and a fanout.
    #[must_use]
    pub fn new(store: Arc<TelemetryStore>, fanout: RealtimeFanout) -> Self {
        Self { store, fanout }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    /// The realtime fanout.
    #[must_use]
    pub fn fanout(&self) -> &RealtimeFanout {
        &self.fanout
    }

    /// Validate, persist and conditionally publish one record.
    ///
    /// `device_id` must come from the verified credential. The record is
    /// stored before anything is published; a publish that reaches nobody
    /// leaves the stored record in place. A known `clientRecordId` returns
    /// the original id without storing or publishing again.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::MalformedPayload`] if validation fails and
    /// [`IngestError::Storage`] if the write fails. Neither stores nor
    /// publishes anything.
    pub fn ingest(
        &self,
        device_id: &str,
        request: IngestRequest,
    ) -> Result<IngestResponse, IngestError> {
        request.validate().map_err(IngestError::MalformedPayload)?;

        let record = StoredRecord {
            id: Uuid::new_v4(),
            client_record_id: request.client_record_id,
            device_id: device_id.to_string(),
            title: request.title,
            user_name: request.user_name,
            latitude: request.latitude,
            longitude: request.longitude,
            recorded_at: request.record_timestamp.unwrap_or_else(Utc::now),
            is_offline: request.is_offline,
            received_at: Utc::now(),
        };

        match self.store.insert(&record)? {
            InsertOutcome::Duplicate { existing_id } => {
                debug!(%device_id, %existing_id, "Resubmitted record acknowledged");
                return Ok(IngestResponse {
                    message: MSG_DUPLICATE.to_string(),
                    id: existing_id.to_string(),
                });
            }
            InsertOutcome::Inserted => {}
        }

        if record.is_offline {
            debug!(%device_id, id = %record.id, "Stored offline record");
            return Ok(IngestResponse {
                message: MSG_OFFLINE.to_string(),
                id: record.id.to_string(),
            });
        }

        let reached = self.fanout.publish(RealtimeUpdate {
            device_id: record.device_id.clone(),
            user_name: record.user_name.clone().unwrap_or_default(),
            latitude: record.latitude,
            longitude: record.longitude,
            timestamp: record.recorded_at,
        });
        info!(%device_id, id = %record.id, subscribers = reached, "Stored and broadcast record");

        Ok(IngestResponse {
            message: MSG_REALTIME.to_string(),
            id: record.id.to_string(),
        })
    }
}
