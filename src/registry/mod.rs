//! Tape registry: authoritative state of tapes, drives and pools.
//!
//! Enforces the media lifecycle transition table and implements tape
//! selection for the backup planner. Labeling goes through a device
//! session and is the only registry operation touching hardware.

use std::sync::Arc;

use anyhow::Error;
use chrono::{DateTime, Duration, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use tba_api_types::{
    AllocationPolicy, Drive, DriveState, Id, Pool, Tape, TapeFormat, TapeStatus,
};
use tba_tape::DeviceSession;

use crate::store::{
    enum_from_sql, enum_to_sql, ts_from_sql, ts_to_sql, Store, StoreError, StoreResult,
};
use crate::tape::{read_media_label, write_media_label, MediaLabel};

pub struct TapeRegistry {
    store: Arc<Store>,
}

fn tape_from_row(row: &Row) -> Result<Tape, rusqlite::Error> {
    let uuid: String = row.get("uuid")?;
    let status: String = row.get("status")?;
    let format: String = row.get("format")?;
    let labeled_at: Option<String> = row.get("labeled_at")?;
    Ok(Tape {
        id: row.get("id")?,
        uuid: uuid.parse().unwrap_or_else(|_| Uuid::nil()),
        label: row.get("label")?,
        barcode: row.get("barcode")?,
        lto_generation: row.get("lto_generation")?,
        pool_id: row.get("pool_id")?,
        status: enum_from_sql(&status).unwrap_or(TapeStatus::Error),
        capacity_bytes: row.get::<_, i64>("capacity_bytes")? as u64,
        used_bytes: row.get::<_, i64>("used_bytes")? as u64,
        write_count: row.get::<_, i64>("write_count")? as u64,
        labeled_at: labeled_at.and_then(|raw| ts_from_sql(&raw).ok()),
        offsite_location: row.get("offsite_location")?,
        format: enum_from_sql(&format).unwrap_or(TapeFormat::Raw),
    })
}

fn pool_from_row(row: &Row) -> Result<Pool, rusqlite::Error> {
    let policy: String = row.get("allocation_policy")?;
    Ok(Pool {
        id: row.get("id")?,
        name: row.get("name")?,
        retention_days: row.get::<_, i64>("retention_days")? as u32,
        allocation_policy: enum_from_sql(&policy).unwrap_or(AllocationPolicy::Sequential),
    })
}

fn drive_from_row(row: &Row) -> Result<Drive, rusqlite::Error> {
    let state: String = row.get("state")?;
    Ok(Drive {
        id: row.get("id")?,
        device_path: row.get("device_path")?,
        serial: row.get("serial")?,
        state: enum_from_sql(&state).unwrap_or(DriveState::Error),
        loaded_tape_id: row.get("loaded_tape_id")?,
    })
}

fn get_tape(conn: &Connection, tape_id: Id) -> StoreResult<Tape> {
    conn.query_row("SELECT * FROM tapes WHERE id = ?1", [tape_id], tape_from_row)
        .optional()?
        .ok_or_else(|| StoreError::NotFound("tape", tape_id.to_string()))
}

impl TapeRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create_pool(
        &self,
        name: &str,
        retention_days: u32,
        policy: AllocationPolicy,
    ) -> StoreResult<Pool> {
        if retention_days < 1 {
            return Err(StoreError::Conflict(
                "pool retention must be at least one day".to_string(),
            ));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pools (name, retention_days, allocation_policy)
                 VALUES (?1, ?2, ?3)",
                params![name, retention_days, enum_to_sql(&policy)],
            )?;
            Ok(Pool {
                id: conn.last_insert_rowid(),
                name: name.to_string(),
                retention_days,
                allocation_policy: policy,
            })
        })
    }

    pub fn lookup_pool(&self, pool_id: Id) -> StoreResult<Pool> {
        self.store.with_conn(|conn| {
            conn.query_row("SELECT * FROM pools WHERE id = ?1", [pool_id], pool_from_row)
                .optional()?
                .ok_or_else(|| StoreError::NotFound("pool", pool_id.to_string()))
        })
    }

    pub fn pool_by_name(&self, name: &str) -> StoreResult<Pool> {
        self.store.with_conn(|conn| {
            conn.query_row("SELECT * FROM pools WHERE name = ?1", [name], pool_from_row)
                .optional()?
                .ok_or_else(|| StoreError::NotFound("pool", name.to_string()))
        })
    }

    /// Register a new cartridge. Tapes start `blank` and must be labeled
    /// before use.
    pub fn create_tape(
        &self,
        label: &str,
        barcode: Option<&str>,
        lto_generation: u8,
        capacity_bytes: u64,
        format: TapeFormat,
    ) -> StoreResult<Tape> {
        let uuid = Uuid::new_v4();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tapes
                   (uuid, label, barcode, lto_generation, status, capacity_bytes, format)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    uuid.to_string(),
                    label,
                    barcode,
                    lto_generation,
                    enum_to_sql(&TapeStatus::Blank),
                    capacity_bytes as i64,
                    enum_to_sql(&format),
                ],
            )?;
            get_tape(conn, conn.last_insert_rowid())
        })
    }

    pub fn lookup_tape(&self, tape_id: Id) -> StoreResult<Tape> {
        self.store.with_conn(|conn| get_tape(conn, tape_id))
    }

    pub fn tape_by_label(&self, label: &str) -> StoreResult<Tape> {
        self.store.with_conn(|conn| {
            conn.query_row("SELECT * FROM tapes WHERE label = ?1", [label], tape_from_row)
                .optional()?
                .ok_or_else(|| StoreError::NotFound("tape", label.to_string()))
        })
    }

    pub fn assign_to_pool(&self, tape_id: Id, pool_id: Id) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tapes SET pool_id = ?2 WHERE id = ?1",
                params![tape_id, pool_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("tape", tape_id.to_string()));
            }
            Ok(())
        })
    }

    /// Write the media label to block 0 and persist `labeled_at`.
    ///
    /// Labels are immutable; relabeling an already labeled tape needs
    /// `force` and resets usage accounting.
    pub fn label_tape(
        &self,
        session: &mut DeviceSession,
        tape_id: Id,
        force: bool,
    ) -> Result<MediaLabel, Error> {
        let tape = self.lookup_tape(tape_id)?;
        if tape.labeled_at.is_some() && !force {
            return Err(StoreError::Conflict(format!(
                "tape '{}' is already labeled (use force to overwrite)",
                tape.label
            ))
            .into());
        }

        let pool_name = match tape.pool_id {
            Some(pool_id) => self.lookup_pool(pool_id)?.name,
            None => String::new(),
        };

        let label = MediaLabel::new(&tape.label, tape.uuid, &pool_name, tape.format);
        write_media_label(session, &label)?;

        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE tapes SET labeled_at = ?2, status = ?3, used_bytes = 0
                 WHERE id = ?1",
                params![
                    tape_id,
                    ts_to_sql(label.created_at),
                    enum_to_sql(&TapeStatus::Blank),
                ],
            )?;
            Ok(())
        })?;

        info!("labeled tape '{}' ({})", tape.label, tape.uuid);
        Ok(label)
    }

    /// Read the label of the loaded tape and match it against the
    /// registry record.
    pub fn verify_loaded_tape(
        &self,
        session: &mut DeviceSession,
        expected: Id,
    ) -> Result<Result<Tape, Option<Tape>>, Error> {
        let tape = self.lookup_tape(expected)?;
        let label = read_media_label(session)?;
        match label {
            Some(label) if label.uuid == tape.uuid => Ok(Ok(tape)),
            Some(label) => {
                let actual = self.tape_by_uuid(&label.uuid).ok();
                Ok(Err(actual))
            }
            None => Ok(Err(None)),
        }
    }

    pub fn tape_by_uuid(&self, uuid: &Uuid) -> StoreResult<Tape> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM tapes WHERE uuid = ?1",
                [uuid.to_string()],
                tape_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound("tape", uuid.to_string()))
        })
    }

    /// Apply a lifecycle transition, refusing everything the table does
    /// not allow.
    pub fn update_status(&self, tape_id: Id, new_status: TapeStatus) -> StoreResult<Tape> {
        self.store.with_tx(|tx| {
            let tape = get_tape(tx, tape_id)?;
            if tape.status == new_status {
                return Ok(tape); // idempotent
            }
            if !tape.status.can_transition_to(new_status) {
                return Err(StoreError::Conflict(format!(
                    "tape '{}': invalid status transition {} -> {}",
                    tape.label, tape.status, new_status
                )));
            }
            if new_status == TapeStatus::Exported && tape.offsite_location.is_none() {
                return Err(StoreError::Conflict(format!(
                    "tape '{}': export requires an offsite location",
                    tape.label
                )));
            }
            tx.execute(
                "UPDATE tapes SET status = ?2 WHERE id = ?1",
                params![tape_id, enum_to_sql(&new_status)],
            )?;
            get_tape(tx, tape_id)
        })
    }

    /// Record the offsite location and move the tape to `exported`.
    pub fn mark_exported(&self, tape_id: Id, location: &str) -> StoreResult<Tape> {
        let tape = self.lookup_tape(tape_id)?;
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE tapes SET offsite_location = ?2, pre_export_status = ?3
                 WHERE id = ?1",
                params![tape_id, location, enum_to_sql(&tape.status)],
            )?;
            Ok(())
        })?;
        self.update_status(tape_id, TapeStatus::Exported)
    }

    /// Bring an exported tape back on site, restoring its previous state.
    pub fn mark_imported(&self, tape_id: Id) -> StoreResult<Tape> {
        let tape = self.lookup_tape(tape_id)?;
        if tape.status != TapeStatus::Exported {
            return Err(StoreError::Conflict(format!(
                "tape '{}' is not exported",
                tape.label
            )));
        }
        let back_to: TapeStatus = self.store.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT pre_export_status FROM tapes WHERE id = ?1",
                    [tape_id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            match raw {
                Some(raw) => enum_from_sql(&raw),
                None => Ok(TapeStatus::Active),
            }
        })?;
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE tapes SET offsite_location = NULL, pre_export_status = NULL
                 WHERE id = ?1",
                params![tape_id],
            )?;
            Ok(())
        })?;
        self.update_status(tape_id, back_to)
    }

    /// Move a full tape to `expired` once the pool retention elapsed.
    pub fn mark_expired(&self, tape_id: Id, now: DateTime<Utc>) -> StoreResult<Tape> {
        let tape = self.lookup_tape(tape_id)?;
        let pool = match tape.pool_id {
            Some(pool_id) => self.lookup_pool(pool_id)?,
            None => {
                return Err(StoreError::Conflict(format!(
                    "tape '{}' belongs to no pool",
                    tape.label
                )))
            }
        };

        let newest_set: Option<String> = self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT MAX(created_at) FROM backup_sets
                     WHERE tape_id = ?1 AND status = 'completed'",
                    [tape_id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten())
        })?;

        if let Some(raw) = newest_set {
            let newest = ts_from_sql(&raw)?;
            let protected_until = newest + Duration::days(pool.retention_days as i64);
            if now < protected_until {
                return Err(StoreError::Conflict(format!(
                    "tape '{}' is retention protected until {}",
                    tape.label, protected_until
                )));
            }
        }

        self.update_status(tape_id, TapeStatus::Expired)
    }

    /// Add written bytes and bump the write counter.
    pub fn update_usage(&self, tape_id: Id, bytes_written: u64) -> StoreResult<Tape> {
        self.store.with_tx(|tx| {
            let tape = get_tape(tx, tape_id)?;
            let used = tape.used_bytes.saturating_add(bytes_written);
            tx.execute(
                "UPDATE tapes SET used_bytes = ?2, write_count = write_count + 1
                 WHERE id = ?1",
                params![tape_id, used.min(tape.capacity_bytes) as i64],
            )?;
            get_tape(tx, tape_id)
        })
    }

    /// Pick the best writable tape of a pool.
    ///
    /// `sequential` prefers the blank tape with the smallest label,
    /// falling back to the least-used active tape. `space-greedy` prefers
    /// the active tape with the most remaining capacity that still fits
    /// `min_free_bytes`, falling back to blank tapes.
    pub fn select_best_from_pool(
        &self,
        pool_id: Id,
        min_free_bytes: u64,
    ) -> StoreResult<Tape> {
        let pool = self.lookup_pool(pool_id)?;

        let blank_sql = "SELECT * FROM tapes
            WHERE pool_id = ?1 AND status = 'blank' AND labeled_at IS NOT NULL
            ORDER BY label ASC LIMIT 1";
        let active_least_used_sql = "SELECT * FROM tapes
            WHERE pool_id = ?1 AND status = 'active'
            ORDER BY used_bytes ASC LIMIT 1";
        let active_most_free_sql = "SELECT * FROM tapes
            WHERE pool_id = ?1 AND status = 'active'
              AND capacity_bytes - used_bytes >= ?2
            ORDER BY capacity_bytes - used_bytes DESC LIMIT 1";

        self.store.with_conn(|conn| {
            let pick = |sql: &str, with_min: bool| -> StoreResult<Option<Tape>> {
                let result = if with_min {
                    conn.query_row(sql, params![pool_id, min_free_bytes as i64], tape_from_row)
                } else {
                    conn.query_row(sql, params![pool_id], tape_from_row)
                };
                Ok(result.optional()?)
            };

            let tape = match pool.allocation_policy {
                AllocationPolicy::Sequential => match pick(blank_sql, false)? {
                    Some(tape) => Some(tape),
                    None => pick(active_least_used_sql, false)?,
                },
                AllocationPolicy::SpaceGreedy => match pick(active_most_free_sql, true)? {
                    Some(tape) => Some(tape),
                    None => pick(blank_sql, false)?,
                },
            };

            tape.ok_or(StoreError::NoTapeAvailable)
        })
    }

    // drive records

    pub fn upsert_drive(&self, device_path: &str, serial: &str) -> StoreResult<Drive> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO drives (device_path, serial) VALUES (?1, ?2)
                 ON CONFLICT(device_path) DO UPDATE SET serial = excluded.serial",
                params![device_path, serial],
            )?;
            conn.query_row(
                "SELECT * FROM drives WHERE device_path = ?1",
                [device_path],
                drive_from_row,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn lookup_drive(&self, device_path: &str) -> StoreResult<Drive> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM drives WHERE device_path = ?1",
                [device_path],
                drive_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound("drive", device_path.to_string()))
        })
    }

    /// Update drive state and loaded tape in one statement.
    pub fn set_drive_state(
        &self,
        drive_id: Id,
        state: DriveState,
        loaded_tape_id: Option<Id>,
    ) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE drives SET state = ?2, loaded_tape_id = ?3 WHERE id = ?1",
                params![drive_id, enum_to_sql(&state), loaded_tape_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("drive", drive_id.to_string()));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod test;
