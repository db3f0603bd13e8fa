//! Storage plumbing shared by the offline queue and the server store.
//!
//! Both sides keep their data in `SQLite`. This module opens connections with
//! the right durability pragmas and applies the schema for each database.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use schema::{Schema, QUEUE_SCHEMA, TELEMETRY_SCHEMA};

/// How hard `SQLite` should work to keep committed writes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// fsync on every commit; survives power loss.
    Full,
    /// fsync at checkpoints; survives process crash.
    Normal,
}

impl Durability {
    fn pragma(self) -> &'static str {
        match self {
            Self::Full => "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;",
            Self::Normal => "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;",
        }
    }
}

/// Open or create a database file and apply its schema.
///
/// Creates the parent directories if they don't exist.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or schema initialization fails.
pub fn open_database(path: &Path, schema: &Schema, durability: Durability) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    debug!("Opening {} database at {}", schema.name, path.display());
    let conn = Connection::open(path).map_err(|source| Error::DatabaseOpen {
        path: path.to_path_buf(),
        source,
    })?;

    conn.execute_batch(durability.pragma())?;
    migrations::initialize_schema(&conn, schema)?;

    info!("{} database opened at {}", schema.name, path.display());
    Ok(conn)
}

/// Open an in-memory database with the given schema (for tests and dry runs).
///
/// # Errors
///
/// Returns an error if the in-memory database cannot be created.
pub fn open_in_memory(schema: &Schema) -> Result<Connection> {
    let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
        path: PathBuf::from(":memory:"),
        source,
    })?;
    migrations::initialize_schema(&conn, schema)?;
    Ok(conn)
}

/// Parse an RFC 3339 column value.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        assert!(open_in_memory(&QUEUE_SCHEMA).is_ok());
        assert!(open_in_memory(&TELEMETRY_SCHEMA).is_ok());
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let base = std::env::temp_dir().join(format!("trackline_storage_test_{}", std::process::id()));
        let nested = base.join("nested/queue.db");
        let _ = std::fs::remove_dir_all(&base);

        let conn = open_database(&nested, &QUEUE_SCHEMA, Durability::Full).unwrap();
        assert!(nested.exists());

        drop(conn);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn test_full_durability_pragma() {
        let path = std::env::temp_dir().join(format!(
            "trackline_pragma_test_{}.db",
            std::process::id()
        ));
        let conn = open_database(&path, &QUEUE_SCHEMA, Durability::Full).unwrap();

        let sync: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sync, 2); // FULL

        drop(conn);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    #[test]
    fn test_parse_timestamp() {
        let parsed = parse_timestamp("2025-01-02T03:04:05+00:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-01-02T03:04:05+00:00");
        assert!(parse_timestamp("not a date").is_none());
    }
}
