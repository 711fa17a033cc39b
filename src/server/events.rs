//! Progress event bus and audit sink.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::info;

use tba_api_types::{ExecutionStatus, Id, ProgressEvent};

/// Fan-out bus for progress events.
///
/// Notification transports (mail, messengers, SSE) subscribe here; the
/// core only publishes typed events.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ProgressEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(tx);
        rx
    }

    pub fn publish(&self, event: ProgressEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        // drop subscribers that went away
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// One audit record, written on every terminal execution transition.
#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub time: DateTime<Utc>,
    pub execution_id: Id,
    pub job_name: String,
    pub status: ExecutionStatus,
    pub detail: String,
}

impl AuditEntry {
    pub fn new(execution_id: Id, job_name: &str, status: ExecutionStatus, detail: &str) -> Self {
        Self {
            time: Utc::now(),
            execution_id,
            job_name: job_name.to_string(),
            status,
            detail: detail.to_string(),
        }
    }
}

/// Narrow audit capability; persistence is someone else's concern.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Default sink: audit records go to the log.
#[derive(Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, entry: AuditEntry) {
        info!(
            "audit: execution {} ({}) -> {}{}",
            entry.execution_id,
            entry.job_name,
            entry.status,
            if entry.detail.is_empty() {
                String::new()
            } else {
                format!(" - {}", entry.detail)
            }
        );
    }
}
