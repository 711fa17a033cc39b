//! Progress events published by running executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ExecutionStatus, Id};

/// Phase of a backup or restore run.
///
/// Serialized internally tagged, so a streaming event renders as
/// `{"phase":"streaming", ...}` with the variant payload inlined.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum ExecutionPhase {
    Initializing,
    Scanning,
    Streaming,
    /// Opt-in read-back between streaming and cataloging.
    Verifying,
    Cataloging,
    Completed,
    Failed {
        kind: String,
        message: String,
    },
    Cancelled,
    Paused {
        reason: String,
    },
}

impl ExecutionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionPhase::Initializing => "initializing",
            ExecutionPhase::Scanning => "scanning",
            ExecutionPhase::Streaming => "streaming",
            ExecutionPhase::Verifying => "verifying",
            ExecutionPhase::Cataloging => "cataloging",
            ExecutionPhase::Completed => "completed",
            ExecutionPhase::Failed { .. } => "failed",
            ExecutionPhase::Cancelled => "cancelled",
            ExecutionPhase::Paused { .. } => "paused",
        }
    }
}

/// Snapshot of one running execution.
///
/// Emitted on every phase change, every 500 ms during streaming, and on
/// completion.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProgressEvent {
    pub execution_id: Id,
    pub job_name: String,
    #[serde(flatten)]
    pub phase: ExecutionPhase,
    pub status: ExecutionStatus,
    pub file_count: u64,
    pub total_files: u64,
    pub bytes_written: u64,
    pub total_bytes: u64,
    /// EWMA write speed over the last 5 seconds, bytes per second.
    pub write_speed_bps: u64,
    pub tape_label: String,
    pub device_path: String,
    pub eta_seconds: Option<u64>,
    pub started_at: DateTime<Utc>,
    /// Last lines of the execution log ring.
    pub log_tail: Vec<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn phase_tagging() {
        let phase = ExecutionPhase::Failed {
            kind: "device".to_string(),
            message: "media error".to_string(),
        };
        let value = serde_json::to_value(&phase).unwrap();
        assert_eq!(value["phase"], "failed");
        assert_eq!(value["kind"], "device");

        let plain = serde_json::to_value(ExecutionPhase::Streaming).unwrap();
        assert_eq!(plain["phase"], "streaming");
    }
}
