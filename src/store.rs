//! Shared SQLite store.
//!
//! Tape registry and catalog share one database. All writers serialize
//! through the connection mutex and short transactions; streaming code
//! never holds a transaction open.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

use tba_api_types::Id;

/// Typed store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} '{1}' not found")]
    NotFound(&'static str, String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backup set {0} not found")]
    SetNotFound(Id),
    #[error("duplicate path '{0}' in backup set")]
    DuplicatePath(String),
    #[error("backup set {0} is not finalized")]
    SetNotFinalized(Id),
    #[error("no writable tape available in pool")]
    NoTapeAvailable,
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pools (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    retention_days INTEGER NOT NULL CHECK(retention_days >= 1),
    allocation_policy TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tapes (
    id INTEGER PRIMARY KEY,
    uuid TEXT NOT NULL UNIQUE,
    label TEXT NOT NULL UNIQUE,
    barcode TEXT,
    lto_generation INTEGER NOT NULL,
    pool_id INTEGER REFERENCES pools(id),
    status TEXT NOT NULL,
    capacity_bytes INTEGER NOT NULL,
    used_bytes INTEGER NOT NULL DEFAULT 0,
    write_count INTEGER NOT NULL DEFAULT 0,
    labeled_at TEXT,
    offsite_location TEXT,
    pre_export_status TEXT,
    format TEXT NOT NULL DEFAULT 'raw'
);

CREATE TABLE IF NOT EXISTS drives (
    id INTEGER PRIMARY KEY,
    device_path TEXT NOT NULL UNIQUE,
    serial TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL DEFAULT 'ready',
    loaded_tape_id INTEGER REFERENCES tapes(id)
);

CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL CHECK(path <> ''),
    type TEXT NOT NULL,
    include_patterns TEXT NOT NULL DEFAULT '[]',
    exclude_patterns TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    source_id INTEGER NOT NULL REFERENCES sources(id),
    pool_id INTEGER NOT NULL REFERENCES pools(id),
    backup_type TEXT NOT NULL,
    cron TEXT NOT NULL,
    retention_days INTEGER NOT NULL,
    encryption_key_fingerprint TEXT,
    per_file_encryption INTEGER NOT NULL DEFAULT 0,
    compression TEXT NOT NULL DEFAULT 'none',
    enabled INTEGER NOT NULL DEFAULT 1,
    last_fire TEXT,
    next_fire TEXT
);

CREATE TABLE IF NOT EXISTS backup_sets (
    id INTEGER PRIMARY KEY,
    job_id INTEGER NOT NULL REFERENCES jobs(id),
    tape_id INTEGER NOT NULL REFERENCES tapes(id),
    parent_set_id INTEGER REFERENCES backup_sets(id),
    backup_type TEXT NOT NULL,
    start_block INTEGER NOT NULL DEFAULT 0,
    end_block INTEGER NOT NULL DEFAULT 0,
    file_count INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    stream_bytes INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    checksum TEXT NOT NULL DEFAULT '',
    encrypted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS catalog_entries (
    id INTEGER PRIMARY KEY,
    backup_set_id INTEGER NOT NULL REFERENCES backup_sets(id),
    file_path TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    file_mode INTEGER NOT NULL,
    mod_time TEXT NOT NULL,
    checksum TEXT NOT NULL DEFAULT '',
    block_offset INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(backup_set_id, file_path)
);
CREATE INDEX IF NOT EXISTS catalog_entries_prefix
    ON catalog_entries(backup_set_id, file_path);

CREATE TABLE IF NOT EXISTS snapshot_entries (
    backup_set_id INTEGER NOT NULL REFERENCES backup_sets(id),
    file_path TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    mod_time TEXT NOT NULL,
    PRIMARY KEY(backup_set_id, file_path)
);

CREATE TABLE IF NOT EXISTS executions (
    id INTEGER PRIMARY KEY,
    job_id INTEGER NOT NULL,
    backup_set_id INTEGER REFERENCES backup_sets(id),
    status TEXT NOT NULL,
    files_processed INTEGER NOT NULL DEFAULT 0,
    bytes_processed INTEGER NOT NULL DEFAULT 0,
    resume_state TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS spanning_sets (
    id INTEGER PRIMARY KEY,
    backup_set_id INTEGER NOT NULL REFERENCES backup_sets(id),
    total_tapes INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS spanning_members (
    id INTEGER PRIMARY KEY,
    spanning_set_id INTEGER NOT NULL REFERENCES spanning_sets(id),
    tape_id INTEGER NOT NULL REFERENCES tapes(id),
    sequence_number INTEGER NOT NULL,
    start_block INTEGER NOT NULL,
    end_block INTEGER NOT NULL DEFAULT 0,
    bytes_written INTEGER NOT NULL DEFAULT 0,
    files_start_index INTEGER NOT NULL DEFAULT 0,
    files_end_index INTEGER NOT NULL DEFAULT 0,
    UNIQUE(spanning_set_id, tape_id),
    UNIQUE(spanning_set_id, sequence_number)
);

CREATE TABLE IF NOT EXISTS tape_change_requests (
    id INTEGER PRIMARY KEY,
    execution_id INTEGER NOT NULL REFERENCES executions(id),
    current_tape_id INTEGER REFERENCES tapes(id),
    reason TEXT NOT NULL,
    status TEXT NOT NULL,
    new_tape_id INTEGER REFERENCES tapes(id),
    created_at TEXT NOT NULL
);
"#;

/// Handle to the shared database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Arc<Self>> {
        let conn = Connection::open(path)?;
        Self::setup(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> StoreResult<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        Self::setup(conn)
    }

    fn setup(conn: Connection) -> StoreResult<Arc<Self>> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// Run a read or a short write against the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let guard = self.lock();
        f(&guard)
    }

    /// Run a short transaction; rolled back on error.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut guard = self.lock();
        let tx = guard.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // a poisoned connection mutex means a writer panicked mid-statement
        self.conn.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Render a unit enum for storage (serde wire name).
pub fn enum_to_sql<T: serde::Serialize>(value: &T) -> String {
    serde_plain::to_string(value).expect("enum serialization is infallible")
}

/// Parse a stored unit enum.
pub fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> StoreResult<T> {
    serde_plain::from_str(raw)
        .map_err(|_| StoreError::Conflict(format!("invalid stored value '{}'", raw)))
}

/// Render a timestamp for storage.
pub fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp.
pub fn ts_from_sql(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Conflict(format!("invalid stored timestamp '{}'", raw)))
}
