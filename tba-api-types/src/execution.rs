//! Execution state types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Id;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let text = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", text)
    }
}

/// Saved position of a paused or failed-but-resumable run.
///
/// Sufficient to continue from the exact file (and byte offset, for
/// tape-full continuation) at which the run stopped.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ResumeState {
    /// Index into the sorted source order of the next (or interrupted) file.
    pub file_index: u64,
    /// Bytes of the interrupted file already on tape, 0 at file boundaries.
    pub byte_offset: u64,
    /// Hex state of the rolling set checksum.
    pub running_checksum: String,
    /// Length of the sorted source order the indices refer to.
    pub source_order_cursor: u64,
}

/// One admitted run of a job (or a restore).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Execution {
    pub id: Id,
    pub job_id: Id,
    pub backup_set_id: Option<Id>,
    pub status: ExecutionStatus,
    pub files_processed: u64,
    pub bytes_processed: u64,
    /// Opaque resume payload, present iff status is paused or
    /// failed-and-resumable.
    pub resume_state: Option<ResumeState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
