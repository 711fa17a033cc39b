// End-to-end test fixture: virtual tape drive, in-memory database,
// full supervisor stack.
//
// # cargo test test::

mod scenarios;

mod properties;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tba_api_types::{
    AllocationPolicy, BackupType, Compression, Execution, Id, Job, Pool, Source, SourceType, Tape,
    TapeFormat,
};

use crate::backup::StaticKeyStore;
use crate::catalog::CatalogStore;
use crate::config::{DriveConfig, DriveKind, TapeBackupConfig, TapeTuning};
use crate::registry::TapeRegistry;
use crate::server::{
    EventBus, ExecutionContext, ExecutionStore, ExecutionSupervisor, JobStore, LogAuditSink,
};
use crate::store::Store;
use crate::tape::{open_session, virtual_drive};

pub(crate) const BLOCK_SIZE: usize = 64 * 1024;

pub(crate) fn testdir(name: &str) -> PathBuf {
    let mut dir: PathBuf = String::from("./target/testout").into();
    dir.push("integration");
    dir.push(name);
    let _ = std::fs::remove_dir_all(&dir);
    let _ = std::fs::create_dir_all(&dir);
    dir
}

pub(crate) struct TestEnv {
    pub dir: PathBuf,
    pub ctx: Arc<ExecutionContext>,
    pub supervisor: Arc<ExecutionSupervisor>,
    pub drive: DriveConfig,
    pub pool: Pool,
}

impl TestEnv {
    pub fn new(name: &str, tape_capacity_blocks: usize) -> Self {
        Self::with_key_store(name, tape_capacity_blocks, StaticKeyStore::new())
    }

    pub fn with_key_store(
        name: &str,
        tape_capacity_blocks: usize,
        key_store: StaticKeyStore,
    ) -> Self {
        let dir = testdir(name);
        let tapes_dir = dir.join("tapes");
        let _ = std::fs::create_dir_all(&tapes_dir);

        let drive = DriveConfig {
            device_path: tapes_dir.to_str().unwrap().to_string(),
            display_name: "vdrive0".to_string(),
            enabled: true,
            kind: DriveKind::Virtual {
                max_size: Some(BLOCK_SIZE * tape_capacity_blocks),
            },
        };

        let config = TapeBackupConfig {
            tape: TapeTuning {
                default_device: Some(drive.device_path.clone()),
                block_size: BLOCK_SIZE,
                buffer_size_mb: 1,
                write_retries: 3,
                verify_after_write: false,
            },
            drives: vec![drive.clone()],
            database: dir.join("catalog.db"),
            state_dir: dir.join("state"),
        };
        config.validate().unwrap();

        let store = Store::open_in_memory().unwrap();
        let ctx = Arc::new(ExecutionContext {
            registry: Arc::new(TapeRegistry::new(store.clone())),
            catalog: Arc::new(CatalogStore::new(store.clone())),
            jobs: Arc::new(JobStore::new(store.clone())),
            executions: Arc::new(ExecutionStore::new(store)),
            key_store: Arc::new(key_store),
            events: Arc::new(EventBus::new()),
            audit: Arc::new(LogAuditSink),
            config,
        });

        let supervisor = ExecutionSupervisor::new(ctx.clone());
        let pool = ctx
            .registry
            .create_pool("p1", 30, AllocationPolicy::Sequential)
            .unwrap();

        Self {
            dir,
            ctx,
            supervisor,
            drive,
            pool,
        }
    }

    /// Register, pool-assign and label a tape; leaves it loaded in the
    /// drive.
    pub fn add_labeled_tape(&self, label: &str, capacity_bytes: u64) -> Tape {
        let tape = self
            .ctx
            .registry
            .create_tape(label, None, 8, capacity_bytes, TapeFormat::Raw)
            .unwrap();
        self.ctx.registry.assign_to_pool(tape.id, self.pool.id).unwrap();

        self.load_tape(label);
        let mut session = open_session(
            &self.drive,
            &self.ctx.lock_dir(),
            self.ctx.config.tape.block_size,
        )
        .unwrap();
        self.ctx
            .registry
            .label_tape(&mut session, tape.id, false)
            .unwrap();
        drop(session);

        self.ctx.registry.lookup_tape(tape.id).unwrap()
    }

    /// Load a tape into the virtual drive (the operator's hands).
    pub fn load_tape(&self, label: &str) {
        virtual_drive(&self.drive).unwrap().load_media(label).unwrap();
    }

    pub fn source_dir(&self, name: &str) -> PathBuf {
        let dir = self.dir.join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    pub fn write_source_file(&self, source: &PathBuf, rel: &str, content: &[u8]) {
        let path = source.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn create_job(
        &self,
        name: &str,
        source_dir: &PathBuf,
        backup_type: BackupType,
        compression: Compression,
        key_fingerprint: Option<&str>,
    ) -> (Job, Source) {
        let source = self
            .ctx
            .jobs
            .create_source(source_dir.to_str().unwrap(), SourceType::Local, &[], &[])
            .unwrap();
        let job = self
            .ctx
            .jobs
            .create_job(
                name,
                source.id,
                self.pool.id,
                backup_type,
                "0 0 2 * * *",
                30,
                key_fingerprint,
                false,
                compression,
            )
            .unwrap();
        (job, source)
    }

    /// Plan and submit a backup, returning the execution id.
    pub fn submit_backup(&self, job: &Job, source: &Source) -> Id {
        let planner = crate::backup::BackupPlanner::new(&self.ctx.registry, &self.ctx.catalog);
        let plan = planner.plan(job, source, None).unwrap();
        self.supervisor.submit_backup(plan, &self.drive).unwrap()
    }

    /// Submit and wait for completion.
    pub fn run_backup(&self, job: &Job, source: &Source) -> Execution {
        let execution_id = self.submit_backup(job, source);
        assert!(
            self.supervisor
                .wait_for(execution_id, Duration::from_secs(60)),
            "backup did not finish in time"
        );
        self.ctx.executions.get_execution(execution_id).unwrap()
    }

    pub fn wait_until(&self, mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    /// Background operator: watches for tape change requests and
    /// acknowledges them with the given tapes, in order.
    pub fn spawn_tape_changer(&self, tapes: Vec<Tape>) -> std::thread::JoinHandle<()> {
        let executions = self.ctx.executions.clone();
        let supervisor = self.supervisor.clone();
        let drive = self.drive.clone();
        std::thread::spawn(move || {
            let mut remaining: std::collections::VecDeque<Tape> = tapes.into();
            let deadline = Instant::now() + Duration::from_secs(60);
            while !remaining.is_empty() && Instant::now() < deadline {
                let pending = executions.pending_change_requests().unwrap_or_default();
                if let Some(request) = pending.first() {
                    let tape = remaining.pop_front().unwrap();
                    // load the cartridge, then acknowledge
                    virtual_drive(&drive).unwrap().load_media(&tape.label).unwrap();
                    supervisor
                        .acknowledge_tape_change(request.id, tape.id)
                        .unwrap();
                } else {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        })
    }

    pub fn sha256_hex(data: &[u8]) -> String {
        hex::encode(openssl::sha::sha256(data))
    }
}
