//! Catalog store: the index of every file written to every tape.
//!
//! Entries of a set become visible to readers only when the set
//! finalizes; finalize happens in one transaction together with the set
//! totals, the source snapshot and the tape usage update. Cancelled sets
//! finalize their already-written entries too, those files are complete
//! on tape and stay restorable.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use tba_api_types::{
    BackupSet, BackupType, CatalogEntry, Id, SetStatus, SnapshotEntry, SpanningMember,
    SpanningSet, SpanningStatus,
};

use crate::store::{
    enum_from_sql, enum_to_sql, ts_from_sql, ts_to_sql, Store, StoreError, StoreResult,
};

pub struct CatalogStore {
    store: Arc<Store>,
}

/// Totals of a finished set stream, applied atomically at finalize.
#[derive(Clone, Debug)]
pub struct SetTotals {
    /// Block behind the last written block.
    pub end_block: u64,
    /// Rolling set checksum, hex.
    pub checksum: String,
    /// Logical stream length (envelope delimiter for restores).
    pub stream_bytes: u64,
    /// Physical bytes added to `usage_tape_id`.
    pub device_bytes: u64,
    /// Tape receiving the usage update (the last volume of the set).
    pub usage_tape_id: Id,
    /// Move the usage tape from active to full.
    pub mark_tape_full: bool,
}

/// A catalog entry resolved to the tape holding it.
#[derive(Clone, Debug)]
pub struct ResolvedEntry {
    pub tape_id: Id,
    /// Spanning member sequence number, 1 for plain sets.
    pub sequence_number: u32,
    pub entry: CatalogEntry,
}

fn set_from_row(row: &Row) -> Result<BackupSet, rusqlite::Error> {
    let status: String = row.get("status")?;
    let backup_type: String = row.get("backup_type")?;
    let created_at: String = row.get("created_at")?;
    Ok(BackupSet {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        tape_id: row.get("tape_id")?,
        parent_set_id: row.get("parent_set_id")?,
        backup_type: enum_from_sql(&backup_type).unwrap_or(BackupType::Full),
        start_block: row.get::<_, i64>("start_block")? as u64,
        end_block: row.get::<_, i64>("end_block")? as u64,
        file_count: row.get::<_, i64>("file_count")? as u64,
        total_bytes: row.get::<_, i64>("total_bytes")? as u64,
        status: enum_from_sql(&status).unwrap_or(SetStatus::Failed),
        checksum: row.get("checksum")?,
        encrypted: row.get::<_, i64>("encrypted")? != 0,
        created_at: ts_from_sql(&created_at).unwrap_or_else(|_| Utc::now()),
    })
}

fn entry_from_row(row: &Row) -> Result<CatalogEntry, rusqlite::Error> {
    let mod_time: String = row.get("mod_time")?;
    Ok(CatalogEntry {
        backup_set_id: row.get("backup_set_id")?,
        file_path: row.get("file_path")?,
        file_size: row.get::<_, i64>("file_size")? as u64,
        file_mode: row.get::<_, i64>("file_mode")? as u32,
        mod_time: ts_from_sql(&mod_time).unwrap_or_else(|_| Utc::now()),
        checksum: row.get("checksum")?,
        block_offset: row.get::<_, i64>("block_offset")? as u64,
    })
}

fn member_from_row(row: &Row) -> Result<SpanningMember, rusqlite::Error> {
    Ok(SpanningMember {
        id: row.get("id")?,
        spanning_set_id: row.get("spanning_set_id")?,
        tape_id: row.get("tape_id")?,
        sequence_number: row.get::<_, i64>("sequence_number")? as u32,
        start_block: row.get::<_, i64>("start_block")? as u64,
        end_block: row.get::<_, i64>("end_block")? as u64,
        bytes_written: row.get::<_, i64>("bytes_written")? as u64,
        files_start_index: row.get::<_, i64>("files_start_index")? as u64,
        files_end_index: row.get::<_, i64>("files_end_index")? as u64,
    })
}

fn get_set(conn: &Connection, set_id: Id) -> StoreResult<BackupSet> {
    conn.query_row("SELECT * FROM backup_sets WHERE id = ?1", [set_id], set_from_row)
        .optional()?
        .ok_or(StoreError::SetNotFound(set_id))
}

/// Readers only see finalized sets (completed, or cancelled with the
/// already-written files kept restorable).
fn check_readable(set: &BackupSet) -> StoreResult<()> {
    match set.status {
        SetStatus::Completed | SetStatus::Cancelled => Ok(()),
        _ => Err(StoreError::SetNotFinalized(set.id)),
    }
}

impl CatalogStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a backup set row in `pending` state.
    pub fn create_set(
        &self,
        job_id: Id,
        tape_id: Id,
        parent_set_id: Option<Id>,
        backup_type: BackupType,
        encrypted: bool,
    ) -> StoreResult<BackupSet> {
        if (parent_set_id.is_some()) != (backup_type == BackupType::Incremental) {
            return Err(StoreError::Conflict(
                "parent set is required for incremental runs and forbidden otherwise".to_string(),
            ));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO backup_sets
                   (job_id, tape_id, parent_set_id, backup_type, status, encrypted, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    job_id,
                    tape_id,
                    parent_set_id,
                    enum_to_sql(&backup_type),
                    enum_to_sql(&SetStatus::Pending),
                    encrypted as i64,
                    ts_to_sql(Utc::now()),
                ],
            )?;
            get_set(conn, conn.last_insert_rowid())
        })
    }

    /// Move a pending set to `running`, recording the start block.
    pub fn mark_running(&self, set_id: Id, start_block: u64) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            let set = get_set(conn, set_id)?;
            if set.status != SetStatus::Pending {
                return Err(StoreError::Conflict(format!(
                    "backup set {} is not pending",
                    set_id
                )));
            }
            conn.execute(
                "UPDATE backup_sets SET status = ?2, start_block = ?3 WHERE id = ?1",
                params![set_id, enum_to_sql(&SetStatus::Running), start_block as i64],
            )?;
            Ok(())
        })
    }

    pub fn lookup_set(&self, set_id: Id) -> StoreResult<BackupSet> {
        self.store.with_conn(|conn| get_set(conn, set_id))
    }

    /// Most recent completed set of a job, the incremental parent.
    pub fn latest_completed_set(&self, job_id: Id) -> StoreResult<Option<BackupSet>> {
        self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM backup_sets
                     WHERE job_id = ?1 AND status = 'completed'
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    [job_id],
                    set_from_row,
                )
                .optional()?)
        })
    }

    /// Append catalog entries, batched in one transaction.
    ///
    /// The entries stay invisible to readers until the set finalizes.
    pub fn append_entries(&self, set_id: Id, entries: &[CatalogEntry]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.store.with_tx(|tx| {
            let set = get_set(tx, set_id)?;
            if !matches!(set.status, SetStatus::Pending | SetStatus::Running) {
                return Err(StoreError::Conflict(format!(
                    "backup set {} is no longer writable",
                    set_id
                )));
            }
            let mut stmt = tx.prepare(
                "INSERT INTO catalog_entries
                   (backup_set_id, file_path, file_size, file_mode, mod_time,
                    checksum, block_offset, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let now = ts_to_sql(Utc::now());
            for entry in entries {
                stmt.execute(params![
                    set_id,
                    entry.file_path,
                    entry.file_size as i64,
                    entry.file_mode as i64,
                    ts_to_sql(entry.mod_time),
                    entry.checksum,
                    entry.block_offset as i64,
                    now,
                ])
                .map_err(|err| match err {
                    rusqlite::Error::SqliteFailure(code, _)
                        if code.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        StoreError::DuplicatePath(entry.file_path.clone())
                    }
                    other => StoreError::Sqlite(other),
                })?;
            }
            Ok(())
        })
    }

    /// Finalize a set atomically: totals, status, source snapshot and
    /// tape usage land in one transaction.
    pub fn finalize_set(
        &self,
        set_id: Id,
        status: SetStatus,
        totals: &SetTotals,
        snapshot: &[SnapshotEntry],
    ) -> StoreResult<BackupSet> {
        if !matches!(status, SetStatus::Completed | SetStatus::Cancelled) {
            return Err(StoreError::Conflict(
                "finalize accepts completed or cancelled".to_string(),
            ));
        }
        self.store.with_tx(|tx| {
            let set = get_set(tx, set_id)?;
            if !matches!(set.status, SetStatus::Pending | SetStatus::Running) {
                return Err(StoreError::Conflict(format!(
                    "backup set {} already finalized",
                    set_id
                )));
            }

            let (file_count, total_bytes): (i64, i64) = tx.query_row(
                "SELECT COUNT(*), COALESCE(SUM(file_size), 0)
                 FROM catalog_entries WHERE backup_set_id = ?1",
                [set_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            tx.execute(
                "UPDATE backup_sets
                 SET status = ?2, end_block = ?3, file_count = ?4, total_bytes = ?5,
                     checksum = ?6, stream_bytes = ?7
                 WHERE id = ?1",
                params![
                    set_id,
                    enum_to_sql(&status),
                    totals.end_block as i64,
                    file_count,
                    total_bytes,
                    totals.checksum,
                    totals.stream_bytes as i64,
                ],
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO snapshot_entries
                       (backup_set_id, file_path, file_size, mod_time)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for entry in snapshot {
                    stmt.execute(params![
                        set_id,
                        entry.file_path,
                        entry.file_size as i64,
                        ts_to_sql(entry.mod_time),
                    ])?;
                }
            }

            // tape accounting in the same transaction; for spanning
            // sets this covers the final volume, earlier volumes are
            // accounted when their tape fills
            tx.execute(
                "UPDATE tapes SET used_bytes = MIN(used_bytes + ?2, capacity_bytes),
                                  write_count = write_count + 1
                 WHERE id = ?1",
                params![totals.usage_tape_id, totals.device_bytes as i64],
            )?;
            tx.execute(
                "UPDATE tapes SET status = 'active'
                 WHERE id = ?1 AND status = 'blank'",
                [totals.usage_tape_id],
            )?;
            if totals.mark_tape_full {
                tx.execute(
                    "UPDATE tapes SET status = 'full'
                     WHERE id = ?1 AND status = 'active'",
                    [totals.usage_tape_id],
                )?;
            }

            get_set(tx, set_id)
        })
    }

    /// Mark an unfinalized set failed. Its entries stay invisible.
    pub fn mark_failed(&self, set_id: Id) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE backup_sets SET status = ?2
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![set_id, enum_to_sql(&SetStatus::Failed)],
            )?;
            Ok(())
        })
    }

    /// Entries of a finalized set below a path prefix.
    pub fn browse(&self, set_id: Id, prefix: &str) -> StoreResult<Vec<CatalogEntry>> {
        self.store.with_conn(|conn| {
            let set = get_set(conn, set_id)?;
            check_readable(&set)?;
            let mut stmt = conn.prepare(
                "SELECT * FROM catalog_entries
                 WHERE backup_set_id = ?1 AND file_path LIKE ?2 || '%'
                 ORDER BY file_path",
            )?;
            let rows = stmt.query_map(params![set_id, prefix], entry_from_row)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    /// Immediate sub-paths below a prefix, for the restore tree view.
    pub fn directory_rollup(&self, set_id: Id, prefix: &str) -> StoreResult<Vec<String>> {
        let entries = self.browse(set_id, prefix)?;
        let mut children = BTreeSet::new();
        for entry in entries {
            let rest = &entry.file_path[prefix.len()..];
            let rest = rest.strip_prefix('/').unwrap_or(rest);
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                Some((dir, _)) => children.insert(format!("{}/", dir)),
                None => children.insert(rest.to_string()),
            };
        }
        Ok(children.into_iter().collect())
    }

    /// Resolve paths of a finalized set to tape positions.
    ///
    /// Unknown paths are reported as `NotFound`. For spanning sets each
    /// entry is attributed to the member whose file-index range contains
    /// it.
    pub fn resolve(&self, set_id: Id, paths: &[String]) -> StoreResult<Vec<ResolvedEntry>> {
        let set = self.lookup_set(set_id)?;
        check_readable(&set)?;

        let all = self.all_entries_in_write_order(set_id)?;
        let members = self.members_of_set(set_id)?;

        let mut resolved = Vec::new();
        for path in paths {
            let index = all
                .iter()
                .position(|entry| &entry.file_path == path)
                .ok_or_else(|| StoreError::NotFound("catalog entry", path.clone()))?;
            resolved.push(attribute_entry(&set, &members, index, all[index].clone()));
        }
        Ok(resolved)
    }

    /// All entries of a finalized set, attributed to tapes, in write
    /// order.
    pub fn resolve_all(&self, set_id: Id) -> StoreResult<Vec<ResolvedEntry>> {
        let set = self.lookup_set(set_id)?;
        check_readable(&set)?;

        let all = self.all_entries_in_write_order(set_id)?;
        let members = self.members_of_set(set_id)?;
        Ok(all
            .into_iter()
            .enumerate()
            .map(|(index, entry)| attribute_entry(&set, &members, index, entry))
            .collect())
    }

    fn all_entries_in_write_order(&self, set_id: Id) -> StoreResult<Vec<CatalogEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM catalog_entries WHERE backup_set_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([set_id], entry_from_row)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    /// Snapshot of a set's source at set time (for incremental diffs).
    pub fn snapshot_of(&self, set_id: Id) -> StoreResult<Vec<SnapshotEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM snapshot_entries WHERE backup_set_id = ?1 ORDER BY file_path",
            )?;
            let rows = stmt.query_map([set_id], |row| {
                let mod_time: String = row.get("mod_time")?;
                Ok(SnapshotEntry {
                    backup_set_id: row.get("backup_set_id")?,
                    file_path: row.get("file_path")?,
                    file_size: row.get::<_, i64>("file_size")? as u64,
                    mod_time: ts_from_sql(&mod_time).unwrap_or_else(|_| Utc::now()),
                })
            })?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    // spanning

    /// Create the spanning record when the first tape fills.
    pub fn create_spanning_set(&self, set_id: Id) -> StoreResult<SpanningSet> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO spanning_sets (backup_set_id, status) VALUES (?1, ?2)",
                params![set_id, enum_to_sql(&SpanningStatus::Running)],
            )?;
            Ok(SpanningSet {
                id: conn.last_insert_rowid(),
                backup_set_id: set_id,
                total_tapes: 0,
                total_bytes: 0,
                status: SpanningStatus::Running,
            })
        })
    }

    pub fn spanning_set_of(&self, set_id: Id) -> StoreResult<Option<SpanningSet>> {
        self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM spanning_sets WHERE backup_set_id = ?1",
                    [set_id],
                    |row| {
                        let status: String = row.get("status")?;
                        Ok(SpanningSet {
                            id: row.get("id")?,
                            backup_set_id: row.get("backup_set_id")?,
                            total_tapes: row.get::<_, i64>("total_tapes")? as u32,
                            total_bytes: row.get::<_, i64>("total_bytes")? as u64,
                            status: enum_from_sql(&status).unwrap_or(SpanningStatus::Failed),
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn add_spanning_member(
        &self,
        spanning_set_id: Id,
        tape_id: Id,
        sequence_number: u32,
        start_block: u64,
        files_start_index: u64,
    ) -> StoreResult<SpanningMember> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO spanning_members
                   (spanning_set_id, tape_id, sequence_number, start_block, files_start_index)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    spanning_set_id,
                    tape_id,
                    sequence_number as i64,
                    start_block as i64,
                    files_start_index as i64,
                ],
            )?;
            conn.query_row(
                "SELECT * FROM spanning_members WHERE id = ?1",
                [conn.last_insert_rowid()],
                member_from_row,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn close_spanning_member(
        &self,
        member_id: Id,
        end_block: u64,
        bytes_written: u64,
        files_end_index: u64,
    ) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE spanning_members
                 SET end_block = ?2, bytes_written = ?3, files_end_index = ?4
                 WHERE id = ?1",
                params![
                    member_id,
                    end_block as i64,
                    bytes_written as i64,
                    files_end_index as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn finalize_spanning_set(
        &self,
        spanning_set_id: Id,
        status: SpanningStatus,
    ) -> StoreResult<()> {
        self.store.with_tx(|tx| {
            let (tapes, bytes): (i64, i64) = tx.query_row(
                "SELECT COUNT(*), COALESCE(SUM(bytes_written), 0)
                 FROM spanning_members WHERE spanning_set_id = ?1",
                [spanning_set_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            tx.execute(
                "UPDATE spanning_sets
                 SET total_tapes = ?2, total_bytes = ?3, status = ?4
                 WHERE id = ?1",
                params![spanning_set_id, tapes, bytes, enum_to_sql(&status)],
            )?;
            Ok(())
        })
    }

    /// Exact on-tape stream length of a set (envelope delimiter).
    pub fn stream_bytes_of(&self, set_id: Id) -> StoreResult<u64> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT stream_bytes FROM backup_sets WHERE id = ?1",
                [set_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|bytes| bytes as u64)
            .ok_or(StoreError::SetNotFound(set_id))
        })
    }

    /// Spanning members of a set in sequence order (empty for plain
    /// sets).
    pub fn spanning_members(&self, set_id: Id) -> StoreResult<Vec<SpanningMember>> {
        self.members_of_set(set_id)
    }

    fn members_of_set(&self, set_id: Id) -> StoreResult<Vec<SpanningMember>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.* FROM spanning_members m
                 JOIN spanning_sets s ON s.id = m.spanning_set_id
                 WHERE s.backup_set_id = ?1
                 ORDER BY m.sequence_number",
            )?;
            let rows = stmt.query_map([set_id], member_from_row)?;
            let mut members = Vec::new();
            for row in rows {
                members.push(row?);
            }
            Ok(members)
        })
    }
}

fn attribute_entry(
    set: &BackupSet,
    members: &[SpanningMember],
    index: usize,
    entry: CatalogEntry,
) -> ResolvedEntry {
    for member in members {
        if (index as u64) >= member.files_start_index && (index as u64) < member.files_end_index {
            return ResolvedEntry {
                tape_id: member.tape_id,
                sequence_number: member.sequence_number,
                entry,
            };
        }
    }
    ResolvedEntry {
        tape_id: set.tape_id,
        sequence_number: 1,
        entry,
    }
}
