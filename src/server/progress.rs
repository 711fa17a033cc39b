//! Per-execution progress state.
//!
//! One tracker per running execution, shared between the engine (which
//! updates counters and the log ring) and the supervisor (which serves
//! snapshots). Write speed is an EWMA over roughly the last five
//! seconds, sampled at the 500 ms publish cadence.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};

use tba_api_types::{ExecutionPhase, ExecutionStatus, Id, ProgressEvent};

/// Lines kept in the per-execution log ring.
const LOG_RING_LINES: usize = 50;

/// Publish cadence during streaming.
pub const PUBLISH_INTERVAL_MS: u64 = 500;

// sampled every 500 ms, window of ~5 s
const EWMA_ALPHA: f64 = 0.1;

struct ProgressState {
    phase: ExecutionPhase,
    status: ExecutionStatus,
    file_count: u64,
    total_files: u64,
    bytes_written: u64,
    total_bytes: u64,
    file_started_at: u64,
    speed_bps: f64,
    last_sample: Option<(Instant, u64)>,
    last_publish: Option<Instant>,
    tape_label: String,
    log: VecDeque<String>,
}

pub struct ProgressTracker {
    execution_id: Id,
    job_name: String,
    device_path: String,
    started_at: DateTime<Utc>,
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub fn new(execution_id: Id, job_name: &str, device_path: &str) -> Self {
        Self {
            execution_id,
            job_name: job_name.to_string(),
            device_path: device_path.to_string(),
            started_at: Utc::now(),
            state: Mutex::new(ProgressState {
                phase: ExecutionPhase::Initializing,
                status: ExecutionStatus::Running,
                file_count: 0,
                total_files: 0,
                bytes_written: 0,
                total_bytes: 0,
                file_started_at: 0,
                speed_bps: 0.0,
                last_sample: None,
                last_publish: None,
                tape_label: String::new(),
                log: VecDeque::with_capacity(LOG_RING_LINES),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn execution_id(&self) -> Id {
        self.execution_id
    }

    pub fn set_totals(&self, total_files: u64, total_bytes: u64) {
        let mut state = self.state();
        state.total_files = total_files;
        state.total_bytes = total_bytes;
    }

    pub fn set_phase(&self, phase: ExecutionPhase) {
        self.state().phase = phase;
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        self.state().status = status;
    }

    pub fn set_tape_label(&self, label: &str) {
        self.state().tape_label = label.to_string();
    }

    /// Account streamed bytes and keep the speed EWMA fresh.
    pub fn add_bytes(&self, count: u64) {
        let mut state = self.state();
        state.bytes_written += count;

        let now = Instant::now();
        match state.last_sample {
            None => state.last_sample = Some((now, state.bytes_written)),
            Some((since, bytes_then)) => {
                let elapsed = now.duration_since(since).as_secs_f64();
                if elapsed >= PUBLISH_INTERVAL_MS as f64 / 1000.0 {
                    let instant_speed = (state.bytes_written - bytes_then) as f64 / elapsed;
                    state.speed_bps = if state.speed_bps == 0.0 {
                        instant_speed
                    } else {
                        EWMA_ALPHA * instant_speed + (1.0 - EWMA_ALPHA) * state.speed_bps
                    };
                    state.last_sample = Some((now, state.bytes_written));
                }
            }
        }
    }

    pub fn file_done(&self) {
        self.state().file_count += 1;
    }

    /// Mark the start of a new file stream (for resume byte offsets).
    pub fn file_start(&self) {
        let mut state = self.state();
        state.file_started_at = state.bytes_written;
    }

    /// Bytes of the current file streamed so far.
    pub fn file_byte_offset(&self) -> u64 {
        let state = self.state();
        state.bytes_written.saturating_sub(state.file_started_at)
    }

    pub fn counters(&self) -> (u64, u64) {
        let state = self.state();
        (state.file_count, state.bytes_written)
    }

    /// Append a line to the log ring (also forwarded to the log).
    pub fn log<S: AsRef<str>>(&self, line: S) {
        let line = line.as_ref();
        log::info!("[{}] {}", self.job_name, line);
        let mut state = self.state();
        if state.log.len() == LOG_RING_LINES {
            state.log.pop_front();
        }
        state.log.push_back(line.to_string());
    }

    /// True at most once per publish interval; used to throttle the
    /// streaming event cadence.
    pub fn publish_due(&self) -> bool {
        let mut state = self.state();
        let now = Instant::now();
        match state.last_publish {
            Some(last) if now.duration_since(last).as_millis() < PUBLISH_INTERVAL_MS as u128 => {
                false
            }
            _ => {
                state.last_publish = Some(now);
                true
            }
        }
    }

    /// Current snapshot as a progress event.
    pub fn snapshot(&self) -> ProgressEvent {
        let state = self.state();
        let remaining = state.total_bytes.saturating_sub(state.bytes_written);
        let eta_seconds = if state.speed_bps > 1.0 && remaining > 0 {
            Some((remaining as f64 / state.speed_bps) as u64)
        } else {
            None
        };
        ProgressEvent {
            execution_id: self.execution_id,
            job_name: self.job_name.clone(),
            phase: state.phase.clone(),
            status: state.status,
            file_count: state.file_count,
            total_files: state.total_files,
            bytes_written: state.bytes_written,
            total_bytes: state.total_bytes,
            write_speed_bps: state.speed_bps as u64,
            tape_label: state.tape_label.clone(),
            device_path: self.device_path.clone(),
            eta_seconds,
            started_at: self.started_at,
            log_tail: state.log.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log_ring_keeps_last_lines() {
        let tracker = ProgressTracker::new(1, "job", "/dev/nst0");
        for i in 0..60 {
            tracker.log(format!("line {}", i));
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.log_tail.len(), LOG_RING_LINES);
        assert_eq!(snapshot.log_tail.first().unwrap(), "line 10");
        assert_eq!(snapshot.log_tail.last().unwrap(), "line 59");
    }

    #[test]
    fn eta_needs_a_speed_sample() {
        let tracker = ProgressTracker::new(1, "job", "/dev/nst0");
        tracker.set_totals(10, 1000);
        assert_eq!(tracker.snapshot().eta_seconds, None);
    }
}
