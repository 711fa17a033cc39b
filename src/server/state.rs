//! Persistence of executions and tape change requests.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use tba_api_types::{
    ChangeReason, ChangeRequestStatus, Execution, ExecutionStatus, Id, ResumeState,
    TapeChangeRequest,
};

use crate::store::{
    enum_from_sql, enum_to_sql, ts_from_sql, ts_to_sql, Store, StoreError, StoreResult,
};

pub struct ExecutionStore {
    store: Arc<Store>,
}

fn execution_from_row(row: &Row) -> Result<Execution, rusqlite::Error> {
    let status: String = row.get("status")?;
    let started_at: String = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    let resume_state: Option<String> = row.get("resume_state")?;
    Ok(Execution {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        backup_set_id: row.get("backup_set_id")?,
        status: enum_from_sql(&status).unwrap_or(ExecutionStatus::Failed),
        files_processed: row.get::<_, i64>("files_processed")? as u64,
        bytes_processed: row.get::<_, i64>("bytes_processed")? as u64,
        resume_state: resume_state.and_then(|raw| serde_json::from_str(&raw).ok()),
        started_at: ts_from_sql(&started_at).unwrap_or_else(|_| Utc::now()),
        finished_at: finished_at.and_then(|raw| ts_from_sql(&raw).ok()),
    })
}

fn request_from_row(row: &Row) -> Result<TapeChangeRequest, rusqlite::Error> {
    let reason: String = row.get("reason")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    Ok(TapeChangeRequest {
        id: row.get("id")?,
        execution_id: row.get("execution_id")?,
        current_tape_id: row.get("current_tape_id")?,
        reason: enum_from_sql(&reason).unwrap_or(ChangeReason::TapeError),
        status: enum_from_sql(&status).unwrap_or(ChangeRequestStatus::Cancelled),
        new_tape_id: row.get("new_tape_id")?,
        created_at: ts_from_sql(&created_at).unwrap_or_else(|_| Utc::now()),
    })
}

impl ExecutionStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create_execution(&self, job_id: Id) -> StoreResult<Execution> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO executions (job_id, status, started_at) VALUES (?1, ?2, ?3)",
                params![
                    job_id,
                    enum_to_sql(&ExecutionStatus::Pending),
                    ts_to_sql(Utc::now()),
                ],
            )?;
            conn.query_row(
                "SELECT * FROM executions WHERE id = ?1",
                [conn.last_insert_rowid()],
                execution_from_row,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn get_execution(&self, execution_id: Id) -> StoreResult<Execution> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM executions WHERE id = ?1",
                [execution_id],
                execution_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound("execution", execution_id.to_string()))
        })
    }

    pub fn set_backup_set(&self, execution_id: Id, set_id: Id) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE executions SET backup_set_id = ?2 WHERE id = ?1",
                params![execution_id, set_id],
            )?;
            Ok(())
        })
    }

    /// Update status; terminal states record `finished_at` and clear any
    /// resume state.
    pub fn set_status(&self, execution_id: Id, status: ExecutionStatus) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            if status.is_terminal() {
                conn.execute(
                    "UPDATE executions
                     SET status = ?2, finished_at = ?3,
                         resume_state = CASE WHEN ?2 = 'failed' THEN resume_state ELSE NULL END
                     WHERE id = ?1",
                    params![execution_id, enum_to_sql(&status), ts_to_sql(Utc::now())],
                )?;
            } else {
                conn.execute(
                    "UPDATE executions SET status = ?2 WHERE id = ?1",
                    params![execution_id, enum_to_sql(&status)],
                )?;
            }
            Ok(())
        })
    }

    pub fn update_counters(&self, execution_id: Id, files: u64, bytes: u64) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE executions SET files_processed = ?2, bytes_processed = ?3 WHERE id = ?1",
                params![execution_id, files as i64, bytes as i64],
            )?;
            Ok(())
        })
    }

    /// Persist (or clear) the opaque resume payload.
    pub fn save_resume_state(
        &self,
        execution_id: Id,
        resume: Option<&ResumeState>,
    ) -> StoreResult<()> {
        let raw = match resume {
            Some(state) => Some(
                serde_json::to_string(state)
                    .map_err(|err| StoreError::Conflict(err.to_string()))?,
            ),
            None => None,
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE executions SET resume_state = ?2 WHERE id = ?1",
                params![execution_id, raw],
            )?;
            Ok(())
        })
    }

    // tape change requests

    pub fn open_change_request(
        &self,
        execution_id: Id,
        current_tape_id: Option<Id>,
        reason: ChangeReason,
    ) -> StoreResult<TapeChangeRequest> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tape_change_requests
                   (execution_id, current_tape_id, reason, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    execution_id,
                    current_tape_id,
                    enum_to_sql(&reason),
                    enum_to_sql(&ChangeRequestStatus::Pending),
                    ts_to_sql(Utc::now()),
                ],
            )?;
            conn.query_row(
                "SELECT * FROM tape_change_requests WHERE id = ?1",
                [conn.last_insert_rowid()],
                request_from_row,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn get_change_request(&self, request_id: Id) -> StoreResult<TapeChangeRequest> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM tape_change_requests WHERE id = ?1",
                [request_id],
                request_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound("tape change request", request_id.to_string()))
        })
    }

    /// Acknowledge with the replacement tape. Only pending requests can
    /// be acknowledged, and the new tape is mandatory.
    pub fn acknowledge_change_request(
        &self,
        request_id: Id,
        new_tape_id: Id,
    ) -> StoreResult<TapeChangeRequest> {
        self.store.with_tx(|tx| {
            let request = tx
                .query_row(
                    "SELECT * FROM tape_change_requests WHERE id = ?1",
                    [request_id],
                    request_from_row,
                )
                .optional()?
                .ok_or_else(|| {
                    StoreError::NotFound("tape change request", request_id.to_string())
                })?;
            if request.status != ChangeRequestStatus::Pending {
                return Err(StoreError::Conflict(format!(
                    "tape change request {} is not pending",
                    request_id
                )));
            }
            tx.execute(
                "UPDATE tape_change_requests SET status = ?2, new_tape_id = ?3 WHERE id = ?1",
                params![
                    request_id,
                    enum_to_sql(&ChangeRequestStatus::Acknowledged),
                    new_tape_id,
                ],
            )?;
            tx.query_row(
                "SELECT * FROM tape_change_requests WHERE id = ?1",
                [request_id],
                request_from_row,
            )
            .map_err(StoreError::from)
        })
    }

    pub fn set_change_request_status(
        &self,
        request_id: Id,
        status: ChangeRequestStatus,
    ) -> StoreResult<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE tape_change_requests SET status = ?2 WHERE id = ?1",
                params![request_id, enum_to_sql(&status)],
            )?;
            Ok(())
        })
    }

    pub fn pending_change_requests(&self) -> StoreResult<Vec<TapeChangeRequest>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tape_change_requests WHERE status = 'pending' ORDER BY id",
            )?;
            let rows = stmt.query_map([], request_from_row)?;
            let mut requests = Vec::new();
            for row in rows {
                requests.push(row?);
            }
            Ok(requests)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_exec_store() -> ExecutionStore {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "INSERT INTO pools (name, retention_days, allocation_policy)
                       VALUES ('p1', 30, 'sequential');
                     INSERT INTO sources (path, type) VALUES ('/data', 'local');
                     INSERT INTO jobs (name, source_id, pool_id, backup_type, cron, retention_days)
                       VALUES ('j1', 1, 1, 'full', '0 0 2 * * *', 30);",
                )?;
                Ok(())
            })
            .unwrap();
        ExecutionStore::new(store)
    }

    #[test]
    fn execution_lifecycle() {
        let store = test_exec_store();
        let execution = store.create_execution(1).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);

        store
            .set_status(execution.id, ExecutionStatus::Running)
            .unwrap();
        store.update_counters(execution.id, 3, 300).unwrap();

        let resume = ResumeState {
            file_index: 3,
            byte_offset: 17,
            running_checksum: "ab".repeat(32),
            source_order_cursor: 10,
        };
        store
            .save_resume_state(execution.id, Some(&resume))
            .unwrap();
        store
            .set_status(execution.id, ExecutionStatus::Paused)
            .unwrap();

        let loaded = store.get_execution(execution.id).unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Paused);
        assert_eq!(loaded.files_processed, 3);
        assert_eq!(loaded.resume_state.as_ref().unwrap().file_index, 3);

        // completion clears the resume payload
        store
            .set_status(execution.id, ExecutionStatus::Completed)
            .unwrap();
        let done = store.get_execution(execution.id).unwrap();
        assert!(done.resume_state.is_none());
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn change_request_needs_new_tape_and_pending_state() {
        let store = test_exec_store();
        let execution = store.create_execution(1).unwrap();

        let request = store
            .open_change_request(execution.id, None, ChangeReason::TapeFull)
            .unwrap();
        assert_eq!(request.status, ChangeRequestStatus::Pending);

        let acked = store.acknowledge_change_request(request.id, 42).unwrap();
        assert_eq!(acked.status, ChangeRequestStatus::Acknowledged);
        assert_eq!(acked.new_tape_id, Some(42));

        // second acknowledge is a conflict
        assert!(store.acknowledge_change_request(request.id, 43).is_err());
    }
}
