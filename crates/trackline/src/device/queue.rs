//! Durable offline queue.
//!
//! A restart-safe FIFO of records that could not be delivered live. Entries
//! are keyed by a monotonically increasing `local_id`; `list_pending` always
//! returns them oldest first. An entry is only removed after the caller has
//! confirmed delivery, so anything not removed before a crash reappears on the
//! next open.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::record::TelemetryRecord;
use crate::storage::{self, Durability, QUEUE_SCHEMA};

/// Persisted projection of an undelivered record.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Local FIFO sequence number.
    pub local_id: i64,
    /// Client record id of the original record.
    pub record_id: Uuid,
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
    /// Capture time of the position.
    pub recorded_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Rebuild the record for redelivery.
    ///
    /// Queued records are by definition offline captures, so the flag is
    /// always set; they never reach the live view.
    #[must_use]
    pub fn to_record(&self) -> TelemetryRecord {
        TelemetryRecord {
            id: self.record_id,
            device_id: self.device_id.clone(),
            title: self.title.clone(),
            user_name: self.user_name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            recorded_at: self.recorded_at,
            is_offline: true,
        }
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let record_id: String = row.get(1)?;
        let recorded_at: String = row.get(7)?;

        let record_id = Uuid::parse_str(&record_id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
        let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?
            .with_timezone(&Utc);

        Ok(Self {
            local_id: row.get(0)?,
            record_id,
            device_id: row.get(2)?,
            title: row.get(3)?,
            user_name: row.get(4)?,
            latitude: row.get(5)?,
            longitude: row.get(6)?,
            recorded_at,
        })
    }
}

/// Statistics about the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of entries waiting for delivery.
    pub pending: i64,
    /// Capture time of the oldest pending entry.
    pub oldest_recorded_at: Option<DateTime<Utc>>,
    /// Capture time of the newest pending entry.
    pub newest_recorded_at: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

/// `SQLite`-backed offline queue.
///
/// The connection sits behind a mutex so one queue instance can be shared
/// through an `Arc` by the capture lane, the send lane and the delivery agent.
/// Every operation is a single short statement.
#[derive(Debug)]
pub struct OfflineQueue {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl OfflineQueue {
    /// Open or create the queue database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = storage::open_database(&path, &QUEUE_SCHEMA, Durability::Full)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory queue for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(storage::open_in_memory(&QUEUE_SCHEMA)?),
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
            .map_err(|_| Error::internal("offline queue lock poisoned"))
    }

    /// Run a queue operation on the blocking thread pool.
    ///
    /// Writes are fsynced before they return, so async lanes go through here
    /// rather than holding a runtime worker for the duration.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error, or an internal error if the
    /// blocking task panicked.
    pub async fn blocking<F, R>(self: &Arc<Self>, op: F) -> Result<R>
    where
        F: FnOnce(&OfflineQueue) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let queue = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&queue))
            .await
            .map_err(|e| Error::internal(format!("queue task failed: {e}")))?
    }

    /// Append a record to the tail of the queue.
    ///
    /// Returns the local id of the new entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn enqueue(&self, record: &TelemetryRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r"
            INSERT INTO pending_records
                (record_id, device_id, title, user_name, latitude, longitude, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                record.id.to_string(),
                record.device_id,
                record.title,
                record.user_name,
                record.latitude,
                record.longitude,
                record.recorded_at.to_rfc3339(),
            ],
        )?;

        let local_id = conn.last_insert_rowid();
        debug!(local_id, record_id = %record.id, "Queued offline record");
        Ok(local_id)
    }

    /// List all pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or a row cannot be decoded.
    pub fn list_pending(&self) -> Result<Vec<QueueEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
            SELECT local_id, record_id, device_id, title, user_name,
                   latitude, longitude, recorded_at
            FROM pending_records ORDER BY local_id ASC
            ",
        )?;

        let entries = stmt
            .query_map([], QueueEntry::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Remove an entry after its delivery was confirmed.
    ///
    /// Returns `true` if an entry was removed, `false` if it was not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn remove_by_id(&self, local_id: i64) -> Result<bool> {
        let affected = self
            .conn()?
            .execute("DELETE FROM pending_records WHERE local_id = ?1", [local_id])?;
        Ok(affected > 0)
    }

    /// Remove every pending entry.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn clear(&self) -> Result<usize> {
        let affected = self.conn()?.execute("DELETE FROM pending_records", [])?;
        if affected > 0 {
            info!("Cleared {} pending records", affected);
        }
        Ok(affected)
    }

    /// Count pending entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn pending_count(&self) -> Result<i64> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM pending_records", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Get queue statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn stats(&self) -> Result<QueueStats> {
        let pending = self.pending_count()?;
        let conn = self.conn()?;

        let oldest: Option<String> = conn
            .query_row(
                "SELECT recorded_at FROM pending_records ORDER BY local_id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let newest: Option<String> = conn
            .query_row(
                "SELECT recorded_at FROM pending_records ORDER BY local_id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(QueueStats {
            pending,
            oldest_recorded_at: oldest.as_deref().and_then(storage::parse_timestamp),
            newest_recorded_at: newest.as_deref().and_then(storage::parse_timestamp),
            db_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeviceIdentity, PositionFix};

    fn create_test_queue() -> OfflineQueue {
        OfflineQueue::open_in_memory().expect("failed to create test queue")
    }

    fn create_test_record(lat: f64) -> TelemetryRecord {
        let identity = DeviceIdentity {
            device_id: "dev-1".to_string(),
            user_name: "alice".to_string(),
            title: "van".to_string(),
        };
        TelemetryRecord::from_fix(&identity, &PositionFix::new(lat, 106.0, 5.0), true)
    }

    fn temp_db_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("trackline_queue_{tag}_{}.db", std::process::id()))
    }

    fn cleanup(path: &Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn test_blocking_runs_off_the_runtime_thread() {
        let queue = Arc::new(create_test_queue());
        let runtime_thread = std::thread::current().id();

        let (local_id, op_thread) = queue
            .blocking(|q| Ok((q.enqueue(&create_test_record(10.0))?, std::thread::current().id())))
            .await
            .unwrap();

        assert_ne!(op_thread, runtime_thread);
        assert_eq!(queue.list_pending().unwrap()[0].local_id, local_id);
    }

    #[tokio::test]
    async fn test_blocking_reports_panicked_op() {
        let queue = Arc::new(create_test_queue());

        let err = queue
            .blocking(|_| -> Result<()> { panic!("disk on fire") })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_enqueue_and_list() {
        let queue = create_test_queue();
        let record = create_test_record(10.0);

        let id = queue.enqueue(&record).unwrap();
        let pending = queue.list_pending().unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].local_id, id);
        assert_eq!(pending[0].record_id, record.id);
        assert_eq!(pending[0].device_id, "dev-1");
        assert_eq!(pending[0].user_name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_list_pending_preserves_insertion_order() {
        let queue = create_test_queue();
        let records: Vec<_> = (0..5).map(|i| create_test_record(f64::from(i))).collect();
        for record in &records {
            queue.enqueue(record).unwrap();
        }

        let pending = queue.list_pending().unwrap();
        let ids: Vec<_> = pending.iter().map(|e| e.record_id).collect();
        let expected: Vec<_> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, expected);
        assert!(pending.windows(2).all(|w| w[0].local_id < w[1].local_id));
    }

    #[test]
    fn test_remove_by_id() {
        let queue = create_test_queue();
        let first = queue.enqueue(&create_test_record(1.0)).unwrap();
        let second = queue.enqueue(&create_test_record(2.0)).unwrap();

        assert!(queue.remove_by_id(first).unwrap());
        assert!(!queue.remove_by_id(first).unwrap());

        let pending = queue.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].local_id, second);
    }

    #[test]
    fn test_local_ids_not_reused_after_removal() {
        let queue = create_test_queue();
        let first = queue.enqueue(&create_test_record(1.0)).unwrap();
        queue.remove_by_id(first).unwrap();
        let second = queue.enqueue(&create_test_record(2.0)).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_clear() {
        let queue = create_test_queue();
        for i in 0..3 {
            queue.enqueue(&create_test_record(f64::from(i))).unwrap();
        }

        assert_eq!(queue.clear().unwrap(), 3);
        assert_eq!(queue.pending_count().unwrap(), 0);
        assert!(queue.list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_entry_to_record_is_offline() {
        let queue = create_test_queue();
        let mut record = create_test_record(3.0);
        record.is_offline = false;
        queue.enqueue(&record).unwrap();

        let entry = &queue.list_pending().unwrap()[0];
        let restored = entry.to_record();
        assert!(restored.is_offline);
        assert_eq!(restored.id, record.id);
        assert_eq!(restored.recorded_at, record.recorded_at);
    }

    #[test]
    fn test_stats() {
        let queue = create_test_queue();
        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 0);
        assert!(stats.oldest_recorded_at.is_none());

        queue.enqueue(&create_test_record(1.0)).unwrap();
        queue.enqueue(&create_test_record(2.0)).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert!(stats.oldest_recorded_at.is_some());
        assert!(stats.newest_recorded_at.is_some());
        assert_eq!(stats.db_size_bytes, 0);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let path = temp_db_path("reopen");
        cleanup(&path);

        let kept = create_test_record(5.0);
        {
            let queue = OfflineQueue::open(&path).unwrap();
            let delivered = queue.enqueue(&create_test_record(4.0)).unwrap();
            queue.enqueue(&kept).unwrap();
            queue.remove_by_id(delivered).unwrap();
            // Dropped without removing `kept`, as if the process died mid-drain.
        }

        let queue = OfflineQueue::open(&path).unwrap();
        let pending = queue.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_id, kept.id);
        assert_eq!(queue.path(), path);

        drop(queue);
        cleanup(&path);
    }

    #[test]
    fn test_corrupt_row_is_an_error() {
        let queue = create_test_queue();
        queue
            .conn()
            .unwrap()
            .execute(
                r"INSERT INTO pending_records
                  (record_id, device_id, latitude, longitude, recorded_at)
                  VALUES ('not-a-uuid', 'dev', 0.0, 0.0, '2025-01-01T00:00:00+00:00')",
                [],
            )
            .unwrap();

        assert!(queue.list_pending().is_err());
    }
}
