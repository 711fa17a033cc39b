//! Execution infrastructure: supervisor, scheduler, control tokens,
//! progress tracking, events and audit.

mod control;
pub use control::*;

mod events;
pub use events::*;

mod progress;
pub use progress::*;

mod state;
pub use state::*;

mod jobs;
pub use jobs::*;

mod supervisor;
pub use supervisor::*;

mod scheduler;
pub use scheduler::*;

use std::sync::Arc;

use crate::backup::KeyStore;
use crate::catalog::CatalogStore;
use crate::config::TapeBackupConfig;
use crate::registry::TapeRegistry;

/// Shared services handed to every engine run.
pub struct ExecutionContext {
    pub config: TapeBackupConfig,
    pub registry: Arc<TapeRegistry>,
    pub catalog: Arc<CatalogStore>,
    pub jobs: Arc<JobStore>,
    pub executions: Arc<ExecutionStore>,
    pub key_store: Arc<dyn KeyStore>,
    pub events: Arc<EventBus>,
    pub audit: Arc<dyn AuditSink>,
}

impl ExecutionContext {
    /// Directory for device lock files.
    pub fn lock_dir(&self) -> std::path::PathBuf {
        self.config.state_dir.join("locks")
    }
}
