//! Server-side system of record.
//!
//! Every accepted record lands here regardless of its offline flag. Client
//! record ids are unique, so a resubmitted record resolves to the row that
//! was stored the first time.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{self, Durability, TELEMETRY_SCHEMA};

/// A persisted telemetry row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Server-assigned identifier.
    pub id: Uuid,
    /// Client-generated identifier, when the client sent one.
    pub client_record_id: Option<Uuid>,
    /// Reporting device, taken from the credential.
    pub device_id: String,
    /// Device label.
    pub title: Option<String>,
    /// Carrier display name.
    pub user_name: Option<String>,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Capture time of the position.
    pub recorded_at: DateTime<Utc>,
    /// Whether the device captured it while offline.
    pub is_offline: bool,
    /// When the server accepted it.
    pub received_at: DateTime<Utc>,
}

const SELECT_COLUMNS: &str = "id, client_record_id, device_id, title, user_name, \
     latitude, longitude, recorded_at, is_offline, received_at";

fn uuid_column(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl StoredRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let client_record_id = match row.get::<_, Option<String>>(1)? {
            Some(_) => Some(uuid_column(row, 1)?),
            None => None,
        };

        Ok(Self {
            id: uuid_column(row, 0)?,
            client_record_id,
            device_id: row.get(2)?,
            title: row.get(3)?,
            user_name: row.get(4)?,
            latitude: row.get(5)?,
            longitude: row.get(6)?,
            recorded_at: timestamp_column(row, 7)?,
            is_offline: row.get(8)?,
            received_at: timestamp_column(row, 9)?,
        })
    }
}

/// Result of an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted,
    /// The client record id was already stored; nothing was written.
    Duplicate {
        /// Server id of the original row.
        existing_id: Uuid,
    },
}

/// `SQLite`-backed telemetry store.
#[derive(Debug)]
pub struct TelemetryStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl TelemetryStore {
    /// Open or create the telemetry database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = storage::open_database(&path, &TELEMETRY_SCHEMA, Durability::Normal)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(storage::open_in_memory(&TELEMETRY_SCHEMA)?),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("telemetry store lock poisoned"))
    }

    /// Persist a record unless its client record id is already known.
    ///
    /// The lookup and the insert run under the same lock, so two concurrent
    /// resubmissions cannot both insert.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write fails.
    pub fn insert(&self, record: &StoredRecord) -> Result<InsertOutcome> {
        let conn = self.conn()?;

        if let Some(client_id) = record.client_record_id {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM telemetry_records WHERE client_record_id = ?1",
                    [client_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                let existing_id = Uuid::parse_str(&existing).map_err(|e| Error::CorruptRecord {
                    id: existing.clone(),
                    message: e.to_string(),
                })?;
                debug!(%client_id, %existing_id, "Duplicate client record id");
                return Ok(InsertOutcome::Duplicate { existing_id });
            }
        }

        conn.execute(
            r"
            INSERT INTO telemetry_records
                (id, client_record_id, device_id, title, user_name,
                 latitude, longitude, recorded_at, is_offline, received_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                record.id.to_string(),
                record.client_record_id.map(|id| id.to_string()),
                record.device_id,
                record.title,
                record.user_name,
                record.latitude,
                record.longitude,
                record.recorded_at.to_rfc3339(),
                record.is_offline,
                record.received_at.to_rfc3339(),
            ],
        )?;

        debug!(id = %record.id, device_id = %record.device_id, "Stored telemetry record");
        Ok(InsertOutcome::Inserted)
    }

    /// Fetch one record by server id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn get(&self, id: Uuid) -> Result<Option<StoredRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM telemetry_records WHERE id = ?1"),
                [id.to_string()],
                StoredRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Most recent records of one device, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn records_for_device(&self, device_id: &str, limit: usize) -> Result<Vec<StoredRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM telemetry_records \
             WHERE device_id = ?1 ORDER BY recorded_at DESC LIMIT ?2"
        ))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map(params![device_id, limit], StoredRecord::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Count stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn count(&self) -> Result<i64> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM telemetry_records", [], |row| row.get(0))?;
        Ok(count)
    }
}
