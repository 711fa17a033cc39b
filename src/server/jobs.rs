//! Job and source configuration records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use tba_api_types::{BackupType, Compression, Id, Job, Source, SourceType};

use crate::store::{
    enum_from_sql, enum_to_sql, ts_from_sql, ts_to_sql, Store, StoreError, StoreResult,
};

pub struct JobStore {
    store: Arc<Store>,
}

fn source_from_row(row: &Row) -> Result<Source, rusqlite::Error> {
    let source_type: String = row.get("type")?;
    let include: String = row.get("include_patterns")?;
    let exclude: String = row.get("exclude_patterns")?;
    Ok(Source {
        id: row.get("id")?,
        path: row.get("path")?,
        source_type: enum_from_sql(&source_type).unwrap_or(SourceType::Local),
        include_patterns: serde_json::from_str(&include).unwrap_or_default(),
        exclude_patterns: serde_json::from_str(&exclude).unwrap_or_default(),
    })
}

fn job_from_row(row: &Row) -> Result<Job, rusqlite::Error> {
    let backup_type: String = row.get("backup_type")?;
    let compression: String = row.get("compression")?;
    let last_fire: Option<String> = row.get("last_fire")?;
    let next_fire: Option<String> = row.get("next_fire")?;
    Ok(Job {
        id: row.get("id")?,
        name: row.get("name")?,
        source_id: row.get("source_id")?,
        pool_id: row.get("pool_id")?,
        backup_type: enum_from_sql(&backup_type).unwrap_or(BackupType::Full),
        cron: row.get("cron")?,
        retention_days: row.get::<_, i64>("retention_days")? as u32,
        encryption_key_fingerprint: row.get("encryption_key_fingerprint")?,
        per_file_encryption: row.get::<_, i64>("per_file_encryption")? != 0,
        compression: enum_from_sql(&compression).unwrap_or(Compression::None),
        enabled: row.get::<_, i64>("enabled")? != 0,
        last_fire: last_fire.and_then(|raw| ts_from_sql(&raw).ok()),
        next_fire: next_fire.and_then(|raw| ts_from_sql(&raw).ok()),
    })
}

impl JobStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create_source(
        &self,
        path: &str,
        source_type: SourceType,
        include_patterns: &[String],
        exclude_patterns: &[String],
    ) -> StoreResult<Source> {
        if path.is_empty() {
            return Err(StoreError::Conflict("source path is empty".to_string()));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sources (path, type, include_patterns, exclude_patterns)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    path,
                    enum_to_sql(&source_type),
                    serde_json::to_string(include_patterns).unwrap_or_else(|_| "[]".to_string()),
                    serde_json::to_string(exclude_patterns).unwrap_or_else(|_| "[]".to_string()),
                ],
            )?;
            conn.query_row(
                "SELECT * FROM sources WHERE id = ?1",
                [conn.last_insert_rowid()],
                source_from_row,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn get_source(&self, source_id: Id) -> StoreResult<Source> {
        self.store.with_conn(|conn| {
            conn.query_row("SELECT * FROM sources WHERE id = ?1", [source_id], source_from_row)
                .optional()?
                .ok_or_else(|| StoreError::NotFound("source", source_id.to_string()))
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_job(
        &self,
        name: &str,
        source_id: Id,
        pool_id: Id,
        backup_type: BackupType,
        cron: &str,
        retention_days: u32,
        encryption_key_fingerprint: Option<&str>,
        per_file_encryption: bool,
        compression: Compression,
    ) -> StoreResult<Job> {
        // reject unparseable schedules at creation time
        if cron.parse::<cron::Schedule>().is_err() {
            return Err(StoreError::Conflict(format!(
                "invalid cron expression '{}'",
                cron
            )));
        }
        // per-file envelopes are only seekable without compression
        if per_file_encryption && compression != Compression::None {
            return Err(StoreError::Conflict(
                "per-file encryption cannot be combined with compression".to_string(),
            ));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs
                   (name, source_id, pool_id, backup_type, cron, retention_days,
                    encryption_key_fingerprint, per_file_encryption, compression)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    name,
                    source_id,
                    pool_id,
                    enum_to_sql(&backup_type),
                    cron,
                    retention_days,
                    encryption_key_fingerprint,
                    per_file_encryption as i64,
                    enum_to_sql(&compression),
                ],
            )?;
            conn.query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                [conn.last_insert_rowid()],
                job_from_row,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn get_job(&self, job_id: Id) -> StoreResult<Job> {
        self.store.with_conn(|conn| {
            conn.query_row("SELECT * FROM jobs WHERE id = ?1", [job_id], job_from_row)
                .optional()?
                .ok_or_else(|| StoreError::NotFound("job", job_id.to_string()))
        })
    }

    pub fn enabled_jobs(&self) -> StoreResult<Vec<Job>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM jobs WHERE enabled = 1 ORDER BY id")?;
            let rows = stmt.query_map([], job_from_row)?;
            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row?);
            }
            Ok(jobs)
        })
    }

    pub fn set_enabled(&self, job_id: Id, enabled: bool) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET enabled = ?2 WHERE id = ?1",
                params![job_id, enabled as i64],
            )?;
            Ok(())
        })
    }

    /// Persist the scheduler's bookkeeping.
    pub fn set_fire_times(
        &self,
        job_id: Id,
        last_fire: Option<DateTime<Utc>>,
        next_fire: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET last_fire = ?2, next_fire = ?3 WHERE id = ?1",
                params![job_id, last_fire.map(ts_to_sql), next_fire.map(ts_to_sql)],
            )?;
            Ok(())
        })
    }

    pub fn delete_job(&self, job_id: Id) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", [job_id])?;
            if changed == 0 {
                return Err(StoreError::NotFound("job", job_id.to_string()));
            }
            Ok(())
        })
    }
}
