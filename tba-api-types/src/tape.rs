//! Types for tapes, drives and media pools.

use anyhow::{bail, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Id;

/// How a pool picks the next writable tape.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationPolicy {
    /// Prefer blank tapes in label order, then the least-used active tape.
    Sequential,
    /// Prefer the active tape with the most remaining capacity.
    SpaceGreedy,
}

impl std::str::FromStr for AllocationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(AllocationPolicy::Sequential),
            "space-greedy" => Ok(AllocationPolicy::SpaceGreedy),
            other => bail!("invalid allocation policy '{}'", other),
        }
    }
}

/// A named group of tapes sharing retention and allocation policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Pool {
    pub id: Id,
    /// Pool name (unique).
    pub name: String,
    /// Days completed sets on member tapes are protected.
    pub retention_days: u32,
    pub allocation_policy: AllocationPolicy,
}

/// Media status.
///
/// Transitions are constrained, see `TapeStatus::can_transition_to`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TapeStatus {
    /// Labeled but never written.
    Blank,
    /// Holds at least one backup set and has remaining capacity.
    Active,
    /// Remaining capacity below the safety margin.
    Full,
    /// Moved offsite; offsite location is recorded.
    Exported,
    /// Retention elapsed, may be overwritten.
    Expired,
    /// End of life.
    Retired,
    /// Media error, needs operator attention.
    Error,
}

impl TapeStatus {
    /// Check the lifecycle transition table.
    ///
    /// `blank → active → full → expired → retired`, with
    /// `active|full → exported → active|full` excursions and `error`
    /// reachable from everywhere.
    pub fn can_transition_to(self, new: TapeStatus) -> bool {
        use TapeStatus::*;
        if new == Error {
            return true;
        }
        matches!(
            (self, new),
            (Blank, Active)
                | (Active, Full)
                | (Full, Expired)
                | (Active, Exported)
                | (Full, Exported)
                | (Exported, Active)
                | (Exported, Full)
                | (Expired, Retired)
                | (Expired, Active)
        )
    }
}

impl std::fmt::Display for TapeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let text = match self {
            TapeStatus::Blank => "blank",
            TapeStatus::Active => "active",
            TapeStatus::Full => "full",
            TapeStatus::Exported => "exported",
            TapeStatus::Expired => "expired",
            TapeStatus::Retired => "retired",
            TapeStatus::Error => "error",
        };
        write!(f, "{}", text)
    }
}

/// On-tape data format.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TapeFormat {
    #[default]
    Raw,
    Ltfs,
}

/// A physical tape cartridge.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Tape {
    pub id: Id,
    pub uuid: Uuid,
    /// Label text, immutable once `labeled_at` is set.
    pub label: String,
    pub barcode: Option<String>,
    /// LTO generation (6..=9).
    pub lto_generation: u8,
    pub pool_id: Option<Id>,
    pub status: TapeStatus,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub write_count: u64,
    pub labeled_at: Option<DateTime<Utc>>,
    pub offsite_location: Option<String>,
    pub format: TapeFormat,
}

impl Tape {
    pub fn remaining_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

/// Drive status as tracked by the registry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DriveState {
    Ready,
    Busy,
    Offline,
    Error,
}

/// A tape drive.
///
/// The drive optionally holds a reference to the loaded tape; tapes never
/// reference drives, so the relation stays acyclic.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Drive {
    pub id: Id,
    pub device_path: String,
    pub serial: String,
    pub state: DriveState,
    pub loaded_tape_id: Option<Id>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tape_status_transitions() {
        use TapeStatus::*;

        assert!(Blank.can_transition_to(Active));
        assert!(Active.can_transition_to(Full));
        assert!(Full.can_transition_to(Expired));
        assert!(Expired.can_transition_to(Retired));
        assert!(Active.can_transition_to(Exported));
        assert!(Exported.can_transition_to(Full));
        assert!(Full.can_transition_to(Error));

        // no shortcuts
        assert!(!Blank.can_transition_to(Full));
        assert!(!Blank.can_transition_to(Exported));
        assert!(!Active.can_transition_to(Retired));
        assert!(!Retired.can_transition_to(Active));
    }
}
