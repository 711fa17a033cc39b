//! Tapebackarr daemon: scheduler plus execution supervisor.
//!
//! Exit codes: 0 success, 1 configuration error, 2 fatal I/O,
//! 3 interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{format_err, Error};
use log::{error, info};

use tapebackarr::backup::StaticKeyStore;
use tapebackarr::catalog::CatalogStore;
use tapebackarr::config::TapeBackupConfig;
use tapebackarr::registry::TapeRegistry;
use tapebackarr::server::{
    EventBus, ExecutionContext, ExecutionStore, ExecutionSupervisor, JobStore, LogAuditSink,
    Scheduler,
};
use tapebackarr::store::Store;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    match args.next() {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from("/etc/tapebackarr/config.json"),
    }
}

fn run(config: TapeBackupConfig) -> Result<(), Error> {
    std::fs::create_dir_all(&config.state_dir)
        .map_err(|err| format_err!("cannot create state dir {:?}: {}", config.state_dir, err))?;

    let store = Store::open(&config.database)?;

    let ctx = Arc::new(ExecutionContext {
        registry: Arc::new(TapeRegistry::new(store.clone())),
        catalog: Arc::new(CatalogStore::new(store.clone())),
        jobs: Arc::new(JobStore::new(store.clone())),
        executions: Arc::new(ExecutionStore::new(store)),
        key_store: Arc::new(StaticKeyStore::new()),
        events: Arc::new(EventBus::new()),
        audit: Arc::new(LogAuditSink),
        config,
    });

    let supervisor = ExecutionSupervisor::new(ctx);
    let scheduler = Scheduler::start(supervisor.clone());

    unsafe {
        libc::signal(libc::SIGINT, on_interrupt as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_interrupt as libc::sighandler_t);
    }

    info!("tapebackarrd running");
    while !INTERRUPTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    scheduler.shutdown();

    if supervisor.active_count() > 0 {
        error!("interrupted with active executions");
        return Err(format_err!("interrupted"));
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let config = match TapeBackupConfig::load(&config_path()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {:#}", err);
            return ExitCode::from(1);
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if INTERRUPTED.load(Ordering::SeqCst) => {
            eprintln!("interrupted: {:#}", err);
            ExitCode::from(3)
        }
        Err(err) => {
            eprintln!("fatal: {:#}", err);
            ExitCode::from(2)
        }
    }
}
