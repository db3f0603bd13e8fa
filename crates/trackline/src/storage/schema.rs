//! `SQLite` schema definitions for trackline.
//!
//! Two databases exist: the device-local offline queue and the server-side
//! system of record. Both carry a `metadata` table for schema versioning.

/// A named set of schema statements applied in order.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    /// Name used in logs and migration errors.
    pub name: &'static str,
    /// Statements creating tables and indexes.
    pub statements: &'static [&'static str],
}

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Device-side queue of undelivered records.
///
/// `local_id` is the FIFO sequence; AUTOINCREMENT guarantees it never reuses
/// the id of a removed entry.
pub const CREATE_PENDING_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS pending_records (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    title TEXT,
    user_name TEXT,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    recorded_at TEXT NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// Server-side history of every accepted record.
pub const CREATE_TELEMETRY_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS telemetry_records (
    id TEXT PRIMARY KEY,
    client_record_id TEXT UNIQUE,
    device_id TEXT NOT NULL,
    title TEXT,
    user_name TEXT,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    recorded_at TEXT NOT NULL,
    is_offline INTEGER NOT NULL,
    received_at TEXT NOT NULL
)
";

/// Index for per-device history queries.
pub const CREATE_DEVICE_TIME_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_telemetry_device_time
    ON telemetry_records(device_id, recorded_at DESC)
";

/// Offline queue schema.
pub const QUEUE_SCHEMA: Schema = Schema {
    name: "offline_queue",
    statements: &[CREATE_METADATA_TABLE, CREATE_PENDING_TABLE],
};

/// Server telemetry store schema.
pub const TELEMETRY_SCHEMA: Schema = Schema {
    name: "telemetry_store",
    statements: &[
        CREATE_METADATA_TABLE,
        CREATE_TELEMETRY_TABLE,
        CREATE_DEVICE_TIME_INDEX,
    ],
};
