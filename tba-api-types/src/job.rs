//! Backup source and job configuration types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Id;

/// Source filesystem type.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Local,
    Smb,
    Nfs,
}

/// A backup source: a path plus include/exclude patterns.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Source {
    pub id: Id,
    pub path: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BackupType::Full => write!(f, "full"),
            BackupType::Incremental => write!(f, "incremental"),
        }
    }
}

/// Stream compression applied before encryption.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

/// A scheduled backup job.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Job {
    pub id: Id,
    pub name: String,
    pub source_id: Id,
    pub pool_id: Id,
    pub backup_type: BackupType,
    /// 6-field cron expression (with seconds).
    pub cron: String,
    pub retention_days: u32,
    /// Fingerprint of the encryption key, `None` for plaintext jobs.
    pub encryption_key_fingerprint: Option<String>,
    /// Wrap every file in its own AEAD envelope (`.enc` entries)
    /// instead of one envelope around the whole set stream.
    pub per_file_encryption: bool,
    pub compression: Compression,
    pub enabled: bool,
    pub last_fire: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
}
