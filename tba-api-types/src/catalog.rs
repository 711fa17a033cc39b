//! Backup set, catalog entry and spanning types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BackupType, Id};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SetStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for SetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let text = match self {
            SetStatus::Pending => "pending",
            SetStatus::Running => "running",
            SetStatus::Completed => "completed",
            SetStatus::Failed => "failed",
            SetStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", text)
    }
}

/// One contiguous write of files to one tape from one job run.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BackupSet {
    pub id: Id,
    pub job_id: Id,
    pub tape_id: Id,
    /// Parent set, present exactly for incremental runs.
    pub parent_set_id: Option<Id>,
    pub backup_type: BackupType,
    pub start_block: u64,
    pub end_block: u64,
    pub file_count: u64,
    pub total_bytes: u64,
    pub status: SetStatus,
    /// Rolling SHA-256 over the per-file digests, hex.
    pub checksum: String,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
}

/// One file inside a backup set.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CatalogEntry {
    pub backup_set_id: Id,
    /// Source-relative path.
    pub file_path: String,
    pub file_size: u64,
    pub file_mode: u32,
    pub mod_time: DateTime<Utc>,
    /// Hex SHA-256, empty if unavailable.
    pub checksum: String,
    pub block_offset: u64,
}

/// mtime+size fingerprint of a file present at set time.
///
/// Written for every source file when a set finalizes; read by the planner
/// to diff incremental runs against their parent.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SnapshotEntry {
    pub backup_set_id: Id,
    pub file_path: String,
    pub file_size: u64,
    pub mod_time: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpanningStatus {
    Running,
    Completed,
    Failed,
}

/// The logical union of member streams on multiple tapes comprising one
/// job run that exceeded a single tape.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SpanningSet {
    pub id: Id,
    pub backup_set_id: Id,
    pub total_tapes: u32,
    pub total_bytes: u64,
    pub status: SpanningStatus,
}

/// One tape's portion of a spanning set. Sequence numbers are contiguous
/// starting at 1.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SpanningMember {
    pub id: Id,
    pub spanning_set_id: Id,
    pub tape_id: Id,
    pub sequence_number: u32,
    pub start_block: u64,
    pub end_block: u64,
    pub bytes_written: u64,
    pub files_start_index: u64,
    pub files_end_index: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    TapeFull,
    TapeError,
    WrongTape,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeRequestStatus {
    Pending,
    Acknowledged,
    Completed,
    Cancelled,
}

/// Operator request to load a different tape into the drive of a paused
/// execution.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TapeChangeRequest {
    pub id: Id,
    pub execution_id: Id,
    pub current_tape_id: Option<Id>,
    pub reason: ChangeReason,
    pub status: ChangeRequestStatus,
    /// Set when the request is acknowledged.
    pub new_tape_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}
