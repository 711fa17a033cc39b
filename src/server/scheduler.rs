//! Cron-driven job scheduler.
//!
//! Every enabled job carries a 6-field cron expression (with seconds).
//! The scheduler thread re-reads the job table each tick, so adding,
//! updating or deleting a job takes effect without restarts; a reload
//! message forces an immediate pass, shutdown stops the thread.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{format_err, Error};
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};

use tba_api_types::Job;

use crate::backup::BackupPlanner;
use crate::config::DriveConfig;

use super::{ExecutionContext, ExecutionSupervisor};

enum SchedulerMsg {
    Reload,
    Shutdown,
}

pub struct Scheduler {
    tx: Sender<SchedulerMsg>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Next fire time of a cron expression after `after`.
pub fn next_fire(cron_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
    let schedule = cron::Schedule::from_str(cron_expr)
        .map_err(|err| format_err!("invalid cron expression '{}' - {}", cron_expr, err))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| format_err!("cron expression '{}' never fires", cron_expr))
}

impl Scheduler {
    /// Spawn the scheduler thread.
    pub fn start(supervisor: Arc<ExecutionSupervisor>) -> Self {
        let (tx, rx) = unbounded();
        let thread = std::thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || scheduler_loop(supervisor, rx))
            .expect("spawning scheduler thread");
        Self {
            tx,
            thread: Some(thread),
        }
    }

    /// Force an immediate pass over the job table.
    pub fn reload(&self) {
        let _ = self.tx.send(SchedulerMsg::Reload);
    }

    pub fn shutdown(mut self) {
        let _ = self.tx.send(SchedulerMsg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn scheduler_loop(supervisor: Arc<ExecutionSupervisor>, rx: Receiver<SchedulerMsg>) {
    info!("scheduler started");
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(SchedulerMsg::Shutdown) => break,
            Ok(SchedulerMsg::Reload) => {}
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
        if let Err(err) = tick(&supervisor) {
            error!("scheduler pass failed: {}", err);
        }
    }
    info!("scheduler stopped");
}

/// One pass: fire every enabled job whose time has come.
fn tick(supervisor: &Arc<ExecutionSupervisor>) -> Result<(), Error> {
    let ctx = supervisor.context();
    let now = Utc::now();

    for job in ctx.jobs.enabled_jobs()? {
        let due = match job.next_fire {
            Some(next) => next <= now,
            // freshly created or edited job: seed next_fire, do not
            // fire immediately
            None => {
                let next = next_fire(&job.cron, now)?;
                ctx.jobs.set_fire_times(job.id, job.last_fire, Some(next))?;
                false
            }
        };
        if !due {
            continue;
        }

        let next = next_fire(&job.cron, now)?;
        // advance the schedule first, a failing job must not fire in a
        // tight loop
        ctx.jobs.set_fire_times(job.id, Some(now), Some(next))?;

        if let Err(err) = fire_job(supervisor, ctx, &job) {
            warn!("job '{}' failed to start: {:#}", job.name, err);
        }
    }
    Ok(())
}

fn fire_job(
    supervisor: &Arc<ExecutionSupervisor>,
    ctx: &Arc<ExecutionContext>,
    job: &Job,
) -> Result<(), Error> {
    let source = ctx.jobs.get_source(job.source_id)?;
    let drive = default_drive(ctx)?;

    let planner = BackupPlanner::new(&ctx.registry, &ctx.catalog);
    let plan = planner.plan(job, &source, None)?;

    let execution_id = supervisor.submit_backup(plan, &drive)?;
    info!(
        "job '{}' fired, execution {} submitted to drive '{}'",
        job.name, execution_id, drive.device_path
    );
    Ok(())
}

/// The drive scheduled jobs run on: `tape.default_device`, or the only
/// enabled drive.
pub fn default_drive(ctx: &ExecutionContext) -> Result<DriveConfig, Error> {
    if let Some(device) = &ctx.config.tape.default_device {
        return Ok(ctx.config.drive(device)?.clone());
    }
    ctx.config
        .drives
        .iter()
        .find(|drive| drive.enabled)
        .cloned()
        .ok_or_else(|| format_err!("no enabled drive configured"))
}
