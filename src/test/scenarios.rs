// End-to-end scenarios against the virtual drive.

use std::time::Duration;

use tba_api_types::{
    BackupType, ChangeReason, Compression, ExecutionStatus, SetStatus, TapeStatus,
};

use crate::restore::RestoreRequest;

use super::{TestEnv, BLOCK_SIZE};

const TAPE_CAPACITY: u64 = 12_000_000_000_000;

/// S1: single-file full backup onto a blank labeled tape.
#[test]
fn s1_single_file_full_backup() {
    let env = TestEnv::new("s1_single_file_full_backup", 64);
    let tape = env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    let content = vec![b'A'; 100];
    env.write_source_file(&source, "a.txt", &content);

    let (job, source) = env.create_job("J1", &source, BackupType::Full, Compression::None, None);
    let execution = env.run_backup(&job, &source);
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.files_processed, 1);

    let set = env
        .ctx
        .catalog
        .lookup_set(execution.backup_set_id.unwrap())
        .unwrap();
    assert_eq!(set.status, SetStatus::Completed);
    assert_eq!(set.file_count, 1);
    assert_eq!(set.total_bytes, 100);
    assert!(set.start_block <= set.end_block);

    let tape = env.ctx.registry.lookup_tape(tape.id).unwrap();
    assert_eq!(tape.status, TapeStatus::Active);
    assert!(tape.used_bytes >= 100 && tape.used_bytes <= 100 + BLOCK_SIZE as u64);

    let entries = env.ctx.catalog.browse(set.id, "").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].file_path, "a.txt");
    assert_eq!(entries[0].file_size, 100);
    assert_eq!(entries[0].checksum, TestEnv::sha256_hex(&content));
    assert!(entries[0].block_offset >= set.start_block);
}

/// S2: incremental with no changes produces an empty child set.
#[test]
fn s2_incremental_without_changes() {
    let env = TestEnv::new("s2_incremental_without_changes", 64);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    env.write_source_file(&source, "a.txt", &vec![b'A'; 100]);

    let (job, source_row) =
        env.create_job("J1", &source, BackupType::Full, Compression::None, None);
    let first = env.run_backup(&job, &source_row);
    let parent_set_id = first.backup_set_id.unwrap();

    // second run of the same job as incremental
    let mut job = env.ctx.jobs.get_job(first.job_id).unwrap();
    job.backup_type = BackupType::Incremental;

    let execution = env.run_backup(&job, &source_row);
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let set = env
        .ctx
        .catalog
        .lookup_set(execution.backup_set_id.unwrap())
        .unwrap();
    assert_eq!(set.status, SetStatus::Completed);
    assert_eq!(set.backup_type, BackupType::Incremental);
    assert_eq!(set.file_count, 0);
    assert_eq!(set.total_bytes, 0);
    assert_eq!(set.parent_set_id, Some(parent_set_id));
}

/// S3: a run exceeding one tape spans onto a second one; restoring
/// everything reproduces the sources byte-exactly.
#[test]
fn s3_two_tape_spanning_roundtrip() {
    // small virtual tapes: ~48 blocks of 64 KiB
    let env = TestEnv::new("s3_two_tape_spanning_roundtrip", 48);
    let tape2 = env.add_labeled_tape("LBL002", TAPE_CAPACITY);
    let tape1 = env.add_labeled_tape("LBL001", TAPE_CAPACITY);
    // labeling leaves LBL001 loaded, which sequential allocation picks
    // first

    let source = env.source_dir("data");
    let mut originals = Vec::new();
    for i in 0..10 {
        // 4 blocks per file
        let content: Vec<u8> = (0..BLOCK_SIZE * 4).map(|n| ((n + i * 37) % 251) as u8).collect();
        env.write_source_file(&source, &format!("f{:02}.bin", i), &content);
        originals.push((format!("f{:02}.bin", i), content));
    }

    let (job, source_row) =
        env.create_job("J3", &source, BackupType::Full, Compression::None, None);

    let changer = env.spawn_tape_changer(vec![tape2.clone()]);
    let execution = env.run_backup(&job, &source_row);
    changer.join().unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let set = env
        .ctx
        .catalog
        .lookup_set(execution.backup_set_id.unwrap())
        .unwrap();
    assert_eq!(set.status, SetStatus::Completed);
    assert_eq!(set.file_count, 10);

    let spanning = env.ctx.catalog.spanning_set_of(set.id).unwrap().unwrap();
    assert_eq!(spanning.total_tapes, 2);
    let members = env.ctx.catalog.spanning_members(set.id).unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].sequence_number, 1);
    assert_eq!(members[0].tape_id, tape1.id);
    assert_eq!(members[1].sequence_number, 2);
    assert_eq!(members[1].tape_id, tape2.id);
    assert!(members[0].files_end_index > 0);

    // restore everything into an empty destination
    let destination = env.dir.join("restored");
    let request = RestoreRequest {
        set_id: set.id,
        paths: Vec::new(),
        prefixes: Vec::new(),
        destination: destination.clone(),
        verify: true,
        overwrite: false,
    };

    env.load_tape("LBL001");
    let changer = env.spawn_tape_changer(vec![tape2.clone()]);
    let execution_id = env.supervisor.submit_restore(request, &env.drive).unwrap();
    assert!(env
        .supervisor
        .wait_for(execution_id, Duration::from_secs(60)));
    changer.join().unwrap();

    let execution = env.ctx.executions.get_execution(execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    for (name, content) in &originals {
        let restored = std::fs::read(destination.join(name)).unwrap();
        assert_eq!(&restored, content, "file {} differs", name);
    }
}

/// S4: a selective restore of files at offsets 10/30 issues one
/// forward pass and restores exactly the requested files.
#[test]
fn s4_selective_restore_ordering() {
    let env = TestEnv::new("s4_selective_restore_ordering", 64);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    env.write_source_file(&source, "x/a", b"content of x/a");
    env.write_source_file(&source, "x/b", b"content of x/b");
    env.write_source_file(&source, "y/c", b"content of y/c");

    let (job, source_row) =
        env.create_job("J4", &source, BackupType::Full, Compression::None, None);
    let execution = env.run_backup(&job, &source_row);
    let set_id = execution.backup_set_id.unwrap();

    let destination = env.dir.join("restored");
    let request = RestoreRequest {
        set_id,
        paths: vec!["y/c".to_string(), "x/a".to_string()],
        prefixes: Vec::new(),
        destination: destination.clone(),
        verify: true,
        overwrite: false,
    };

    env.load_tape("LBL001");
    let execution_id = env.supervisor.submit_restore(request, &env.drive).unwrap();
    assert!(env
        .supervisor
        .wait_for(execution_id, Duration::from_secs(30)));
    let execution = env.ctx.executions.get_execution(execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.files_processed, 2);

    assert_eq!(
        std::fs::read(destination.join("x/a")).unwrap(),
        b"content of x/a"
    );
    assert_eq!(
        std::fs::read(destination.join("y/c")).unwrap(),
        b"content of y/c"
    );
    assert!(!destination.join("x/b").exists());
}

/// S5: cancel mid-run leaves a readable tape and a catalog holding
/// exactly the completed files.
#[test]
fn s5_cancel_mid_run() {
    let env = TestEnv::new("s5_cancel_mid_run", 4096);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    // first file large enough to give the controller time to act
    env.write_source_file(&source, "a-first.bin", &vec![0x5a; BLOCK_SIZE * 32]);
    for i in 0..200 {
        env.write_source_file(&source, &format!("file{:03}.bin", i), &vec![i as u8; 4096]);
    }

    let (job, source_row) =
        env.create_job("J5", &source, BackupType::Full, Compression::None, None);
    let execution_id = env.submit_backup(&job, &source_row);

    // wait until streaming made progress, then pause at a file boundary
    assert!(env.wait_until(
        || env
            .supervisor
            .snapshot(execution_id)
            .map(|snapshot| snapshot.file_count >= 1)
            .unwrap_or(false),
        Duration::from_secs(30),
    ));
    env.supervisor.pause(execution_id).unwrap();

    assert!(env.wait_until(
        || env
            .ctx
            .executions
            .get_execution(execution_id)
            .map(|execution| execution.status == ExecutionStatus::Paused)
            .unwrap_or(false),
        Duration::from_secs(30),
    ));

    let paused = env.ctx.executions.get_execution(execution_id).unwrap();
    let boundary = paused.resume_state.as_ref().unwrap().file_index;
    assert!(boundary >= 1);

    env.supervisor.cancel(execution_id).unwrap();
    assert!(env
        .supervisor
        .wait_for(execution_id, Duration::from_secs(30)));

    let execution = env.ctx.executions.get_execution(execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    let set = env
        .ctx
        .catalog
        .lookup_set(execution.backup_set_id.unwrap())
        .unwrap();
    assert_eq!(set.status, SetStatus::Cancelled);

    // exactly the files completed before the pause boundary
    let entries = env.ctx.catalog.browse(set.id, "").unwrap();
    assert_eq!(entries.len() as u64, boundary);

    // and they restore cleanly
    let destination = env.dir.join("restored");
    env.load_tape("LBL001");
    let request = RestoreRequest {
        set_id: set.id,
        paths: Vec::new(),
        prefixes: Vec::new(),
        destination: destination.clone(),
        verify: true,
        overwrite: false,
    };
    let restore_id = env.supervisor.submit_restore(request, &env.drive).unwrap();
    assert!(env.supervisor.wait_for(restore_id, Duration::from_secs(30)));
    let restore = env.ctx.executions.get_execution(restore_id).unwrap();
    assert_eq!(restore.status, ExecutionStatus::Completed);
    assert_eq!(restore.files_processed, boundary);
}

/// S6: wrong tape on restore pauses with a wrong-tape request; loading
/// the right tape and acknowledging completes the run.
#[test]
fn s6_wrong_tape_on_restore() {
    let env = TestEnv::new("s6_wrong_tape_on_restore", 64);
    let tape2 = env.add_labeled_tape("LBL002", TAPE_CAPACITY);
    let tape1 = env.add_labeled_tape("LBL001", TAPE_CAPACITY);
    let _ = tape2;

    let source = env.source_dir("data");
    env.write_source_file(&source, "a.txt", b"needs the right tape");
    let (job, source_row) =
        env.create_job("J6", &source, BackupType::Full, Compression::None, None);
    let execution = env.run_backup(&job, &source_row);
    let set_id = execution.backup_set_id.unwrap();

    // operator loads the wrong tape
    env.load_tape("LBL002");

    let destination = env.dir.join("restored");
    let request = RestoreRequest {
        set_id,
        paths: Vec::new(),
        prefixes: Vec::new(),
        destination: destination.clone(),
        verify: false,
        overwrite: false,
    };
    let restore_id = env.supervisor.submit_restore(request, &env.drive).unwrap();

    // a wrong-tape change request appears and the run pauses
    assert!(env.wait_until(
        || env
            .ctx
            .executions
            .pending_change_requests()
            .map(|requests| requests
                .iter()
                .any(|r| r.execution_id == restore_id && r.reason == ChangeReason::WrongTape))
            .unwrap_or(false),
        Duration::from_secs(30),
    ));
    let request_row = env
        .ctx
        .executions
        .pending_change_requests()
        .unwrap()
        .into_iter()
        .find(|r| r.execution_id == restore_id)
        .unwrap();

    // load the right tape and acknowledge
    env.load_tape("LBL001");
    env.supervisor
        .acknowledge_tape_change(request_row.id, tape1.id)
        .unwrap();

    assert!(env.supervisor.wait_for(restore_id, Duration::from_secs(30)));
    let restore = env.ctx.executions.get_execution(restore_id).unwrap();
    assert_eq!(restore.status, ExecutionStatus::Completed);
    assert_eq!(
        std::fs::read(destination.join("a.txt")).unwrap(),
        b"needs the right tape"
    );
}

/// Queued submissions on one drive run in FIFO order, one at a time.
#[test]
fn fifo_admission_per_drive() {
    let env = TestEnv::new("fifo_admission_per_drive", 256);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    env.write_source_file(&source, "a.txt", &vec![1u8; 8192]);
    let (job, source_row) =
        env.create_job("J-fifo", &source, BackupType::Full, Compression::None, None);

    let first = env.submit_backup(&job, &source_row);
    let second = env.submit_backup(&job, &source_row);

    assert!(env.supervisor.wait_for(first, Duration::from_secs(30)));
    assert!(env.supervisor.wait_for(second, Duration::from_secs(30)));

    let first = env.ctx.executions.get_execution(first).unwrap();
    let second = env.ctx.executions.get_execution(second).unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(second.status, ExecutionStatus::Completed);

    // both sets landed on the same tape, the second appended behind the
    // first
    let set1 = env.ctx.catalog.lookup_set(first.backup_set_id.unwrap()).unwrap();
    let set2 = env.ctx.catalog.lookup_set(second.backup_set_id.unwrap()).unwrap();
    assert_eq!(set1.tape_id, set2.tape_id);
    assert!(set2.start_block >= set1.end_block);
}
