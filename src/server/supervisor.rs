//! Execution supervisor: the single source of truth for running work.
//!
//! At most one execution runs per drive; further submissions queue FIFO
//! per drive and dispatch as workers finish. Control signals travel
//! through each execution's [`TaskControl`] token and are idempotent.
//! Terminal transitions are recorded in the execution store, written to
//! the audit sink and published as a final progress event.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{format_err, Error};
use log::error;

use tba_api_types::{DriveState, ExecutionPhase, ExecutionStatus, Id, ProgressEvent};
use tba_tape::DeviceError;

use crate::backup::{BackupEngine, BackupPlan};
use crate::config::DriveConfig;
use crate::restore::{RestoreEngine, RestoreRequest};
use crate::store::StoreError;

use super::{
    AuditEntry, ExecutionContext, ProgressTracker, TapeChangeAck, TaskControl,
};

/// Hard ceiling for one run.
const RUN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

enum Submission {
    Backup {
        plan: Box<BackupPlan>,
        drive: DriveConfig,
    },
    Restore {
        request: RestoreRequest,
        drive: DriveConfig,
    },
}

impl Submission {
    fn drive(&self) -> &DriveConfig {
        match self {
            Submission::Backup { drive, .. } => drive,
            Submission::Restore { drive, .. } => drive,
        }
    }

    fn job_name(&self) -> String {
        match self {
            Submission::Backup { plan, .. } => plan.job.name.clone(),
            Submission::Restore { request, .. } => format!("restore-set-{}", request.set_id),
        }
    }
}

struct ExecHandle {
    control: TaskControl,
    tracker: Arc<ProgressTracker>,
}

#[derive(Default)]
struct DriveQueue {
    running: Option<Id>,
    queue: VecDeque<(Id, Submission)>,
}

#[derive(Default)]
struct SupervisorState {
    drives: HashMap<String, DriveQueue>,
    handles: HashMap<Id, ExecHandle>,
}

pub struct ExecutionSupervisor {
    ctx: Arc<ExecutionContext>,
    state: Mutex<SupervisorState>,
}

/// Map an engine failure onto the error taxonomy for the terminal
/// event.
fn classify_error(err: &Error) -> &'static str {
    if err.downcast_ref::<DeviceError>().is_some() {
        return "device";
    }
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::NotFound(_, _)) | Some(StoreError::SetNotFound(_)) => "not_found",
        Some(StoreError::Conflict(_))
        | Some(StoreError::DuplicatePath(_))
        | Some(StoreError::SetNotFinalized(_)) => "conflict",
        Some(StoreError::NoTapeAvailable) => "conflict",
        _ => {
            let text = format!("{:#}", err);
            if text.contains("verify") || text.contains("checksum") {
                "verification"
            } else {
                "internal"
            }
        }
    }
}

impl ExecutionSupervisor {
    pub fn new(ctx: Arc<ExecutionContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: Mutex::new(SupervisorState::default()),
        })
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Submit a backup plan. Returns the execution id; the run starts
    /// once its drive is free.
    pub fn submit_backup(
        self: &Arc<Self>,
        plan: BackupPlan,
        drive: &DriveConfig,
    ) -> Result<Id, Error> {
        let execution = self.ctx.executions.create_execution(plan.job.id)?;
        self.enqueue(
            execution.id,
            Submission::Backup {
                plan: Box::new(plan),
                drive: drive.clone(),
            },
        );
        Ok(execution.id)
    }

    /// Submit a restore request.
    pub fn submit_restore(
        self: &Arc<Self>,
        request: RestoreRequest,
        drive: &DriveConfig,
    ) -> Result<Id, Error> {
        let set = self.ctx.catalog.lookup_set(request.set_id)?;
        let execution = self.ctx.executions.create_execution(set.job_id)?;
        self.enqueue(
            execution.id,
            Submission::Restore {
                request,
                drive: drive.clone(),
            },
        );
        Ok(execution.id)
    }

    fn enqueue(self: &Arc<Self>, execution_id: Id, submission: Submission) {
        let device_path = submission.drive().device_path.clone();
        {
            let mut state = self.state();
            state
                .drives
                .entry(device_path.clone())
                .or_default()
                .queue
                .push_back((execution_id, submission));
        }
        self.dispatch(&device_path);
    }

    /// Start the next queued execution of a drive, if it is idle.
    fn dispatch(self: &Arc<Self>, device_path: &str) {
        let (execution_id, submission, control, tracker) = {
            let mut state = self.state();
            let queue = match state.drives.get_mut(device_path) {
                Some(queue) => queue,
                None => return,
            };
            if queue.running.is_some() {
                return; // admission: one running execution per drive
            }
            let (execution_id, submission) = match queue.queue.pop_front() {
                Some(next) => next,
                None => return,
            };
            queue.running = Some(execution_id);

            let control = TaskControl::new();
            let tracker = Arc::new(ProgressTracker::new(
                execution_id,
                &submission.job_name(),
                device_path,
            ));
            state.handles.insert(
                execution_id,
                ExecHandle {
                    control: control.clone(),
                    tracker: tracker.clone(),
                },
            );
            (execution_id, submission, control, tracker)
        };

        if let Err(err) = self
            .ctx
            .executions
            .set_status(execution_id, ExecutionStatus::Running)
        {
            error!("cannot mark execution {} running: {}", execution_id, err);
        }
        if let Ok(drive) = self.ctx.registry.upsert_drive(device_path, "") {
            let _ = self
                .ctx
                .registry
                .set_drive_state(drive.id, DriveState::Busy, None);
        }

        // whole-run watchdog
        let watchdog = control.clone();
        std::thread::Builder::new()
            .name(format!("watchdog-{}", execution_id))
            .spawn(move || {
                if !watchdog.wait_done(RUN_TIMEOUT) {
                    error!("execution {} exceeded the run timeout, cancelling", execution_id);
                    watchdog.cancel();
                }
            })
            .expect("spawning watchdog");

        let supervisor = self.clone();
        let device_path = device_path.to_string();
        std::thread::Builder::new()
            .name(format!("execution-{}", execution_id))
            .spawn(move || {
                supervisor.run_worker(execution_id, submission, control, tracker, &device_path);
            })
            .expect("spawning execution worker");
    }

    fn run_worker(
        self: Arc<Self>,
        execution_id: Id,
        submission: Submission,
        control: TaskControl,
        tracker: Arc<ProgressTracker>,
        device_path: &str,
    ) {
        let job_name = submission.job_name();
        let result: Result<ExecutionStatus, Error> = match &submission {
            Submission::Backup { plan, drive } => {
                BackupEngine::new(self.ctx.clone(), execution_id, control.clone(), tracker.clone())
                    .run(plan, drive)
                    .map(|outcome| outcome.status)
            }
            Submission::Restore { request, drive } => {
                RestoreEngine::new(self.ctx.clone(), execution_id, control.clone(), tracker.clone())
                    .run(request, drive)
                    .map(|_| ExecutionStatus::Completed)
            }
        };

        let (status, detail) = match result {
            Ok(status) => (status, String::new()),
            Err(err) if control.is_cancelled() => {
                tracker.log("cancelled");
                (ExecutionStatus::Cancelled, format!("{:#}", err))
            }
            Err(err) => {
                let kind = classify_error(&err);
                let message = format!("{:#}", err);
                tracker.log(format!("failed: {}", message));
                tracker.set_status(ExecutionStatus::Failed);
                tracker.set_phase(ExecutionPhase::Failed {
                    kind: kind.to_string(),
                    message: message.clone(),
                });
                self.ctx.events.publish(tracker.snapshot());
                (ExecutionStatus::Failed, message)
            }
        };

        if let Err(err) = self.ctx.executions.set_status(execution_id, status) {
            error!(
                "cannot record terminal status of execution {}: {}",
                execution_id, err
            );
        }
        self.ctx
            .audit
            .record(AuditEntry::new(execution_id, &job_name, status, &detail));

        if let Ok(drive) = self.ctx.registry.lookup_drive(device_path) {
            let _ = self
                .ctx
                .registry
                .set_drive_state(drive.id, DriveState::Ready, None);
        }

        {
            let mut state = self.state();
            state.handles.remove(&execution_id);
            if let Some(queue) = state.drives.get_mut(device_path) {
                if queue.running == Some(execution_id) {
                    queue.running = None;
                }
            }
        }
        control.mark_done();

        // FIFO: start whatever queued behind us
        self.dispatch(device_path);
    }

    // control surface; all signals are idempotent

    pub fn pause(&self, execution_id: Id) -> Result<(), Error> {
        self.with_handle(execution_id, |handle| handle.control.pause())
    }

    pub fn resume(&self, execution_id: Id) -> Result<(), Error> {
        self.with_handle(execution_id, |handle| handle.control.resume())
    }

    /// Cancel a running or queued execution.
    pub fn cancel(&self, execution_id: Id) -> Result<(), Error> {
        // queued executions are cancelled without ever starting
        let dequeued = {
            let mut state = self.state();
            let mut found = false;
            for queue in state.drives.values_mut() {
                let before = queue.queue.len();
                queue.queue.retain(|(id, _)| *id != execution_id);
                if queue.queue.len() != before {
                    found = true;
                }
            }
            found
        };
        if dequeued {
            self.ctx
                .executions
                .set_status(execution_id, ExecutionStatus::Cancelled)?;
            self.ctx.audit.record(AuditEntry::new(
                execution_id,
                "(queued)",
                ExecutionStatus::Cancelled,
                "cancelled before start",
            ));
            return Ok(());
        }
        self.with_handle(execution_id, |handle| handle.control.cancel())
    }

    fn with_handle(
        &self,
        execution_id: Id,
        f: impl FnOnce(&ExecHandle),
    ) -> Result<(), Error> {
        let state = self.state();
        match state.handles.get(&execution_id) {
            Some(handle) => {
                f(handle);
                Ok(())
            }
            None => Err(format_err!("execution {} is not active", execution_id)),
        }
    }

    /// Route an operator tape-change acknowledgment to the waiting
    /// engine.
    pub fn acknowledge_tape_change(&self, request_id: Id, new_tape_id: Id) -> Result<(), Error> {
        let request = self
            .ctx
            .executions
            .acknowledge_change_request(request_id, new_tape_id)?;
        self.with_handle(request.execution_id, |handle| {
            handle.control.acknowledge_tape_change(TapeChangeAck {
                request_id,
                new_tape_id,
            })
        })
    }

    /// Snapshot of one active execution.
    pub fn snapshot(&self, execution_id: Id) -> Option<ProgressEvent> {
        self.state()
            .handles
            .get(&execution_id)
            .map(|handle| handle.tracker.snapshot())
    }

    /// Snapshots of everything currently active, ordered by execution
    /// id.
    pub fn snapshots(&self) -> Vec<ProgressEvent> {
        let state = self.state();
        let mut events: Vec<ProgressEvent> = state
            .handles
            .values()
            .map(|handle| handle.tracker.snapshot())
            .collect();
        events.sort_by_key(|event| event.execution_id);
        events
    }

    /// Names of active executions (running or queued) per drive.
    pub fn active_count(&self) -> usize {
        let state = self.state();
        state.handles.len()
            + state
                .drives
                .values()
                .map(|queue| queue.queue.len())
                .sum::<usize>()
    }

    /// Block until the given execution finishes (it may still be
    /// queued when this is called).
    pub fn wait_for(&self, execution_id: Id, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let (control, queued) = {
                let state = self.state();
                let control = state
                    .handles
                    .get(&execution_id)
                    .map(|handle| handle.control.clone());
                let queued = state
                    .drives
                    .values()
                    .any(|queue| queue.queue.iter().any(|(id, _)| *id == execution_id));
                (control, queued)
            };
            match control {
                Some(control) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    return control.wait_done(deadline - now);
                }
                None if queued => {
                    if std::time::Instant::now() >= deadline {
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                None => return true, // already finished
            }
        }
    }
}
