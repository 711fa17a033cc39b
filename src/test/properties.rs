// Property-style end-to-end checks.

use std::time::Duration;

use tba_api_types::{BackupType, Compression, ExecutionStatus, SetStatus};

use crate::backup::StaticKeyStore;
use crate::restore::RestoreRequest;

use super::{TestEnv, BLOCK_SIZE};

const TAPE_CAPACITY: u64 = 12_000_000_000_000;

fn restore_all(env: &TestEnv, set_id: i64, destination: &std::path::Path, overwrite: bool) {
    let request = RestoreRequest {
        set_id,
        paths: Vec::new(),
        prefixes: Vec::new(),
        destination: destination.to_path_buf(),
        verify: true,
        overwrite,
    };
    let execution_id = env.supervisor.submit_restore(request, &env.drive).unwrap();
    assert!(env
        .supervisor
        .wait_for(execution_id, Duration::from_secs(60)));
    let execution = env.ctx.executions.get_execution(execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

/// Restore reproduces every file byte-exactly, and restoring twice
/// with overwrite produces identical output.
#[test]
fn roundtrip_is_byte_exact_and_idempotent() {
    let env = TestEnv::new("roundtrip_idempotent", 256);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    let files: Vec<(String, Vec<u8>)> = (0..20)
        .map(|i| {
            let content: Vec<u8> = (0..(i * 1000 + 17)).map(|n| ((n * 7 + i) % 256) as u8).collect();
            (format!("dir{}/file{}.bin", i % 3, i), content)
        })
        .collect();
    for (name, content) in &files {
        env.write_source_file(&source, name, content);
    }

    let (job, source_row) =
        env.create_job("J-rt", &source, BackupType::Full, Compression::None, None);
    let execution = env.run_backup(&job, &source_row);
    let set_id = execution.backup_set_id.unwrap();

    let entries = env.ctx.catalog.browse(set_id, "").unwrap();
    assert_eq!(entries.len(), files.len());
    for entry in &entries {
        let (_, content) = files
            .iter()
            .find(|(name, _)| name == &entry.file_path)
            .unwrap();
        assert_eq!(entry.checksum, TestEnv::sha256_hex(content));
    }

    env.load_tape("LBL001");
    let destination = env.dir.join("restored");
    restore_all(&env, set_id, &destination, false);
    for (name, content) in &files {
        assert_eq!(&std::fs::read(destination.join(name)).unwrap(), content);
    }

    // second pass with overwrite yields the same bytes
    env.load_tape("LBL001");
    restore_all(&env, set_id, &destination, true);
    for (name, content) in &files {
        assert_eq!(&std::fs::read(destination.join(name)).unwrap(), content);
    }
}

/// Compressed and encrypted sets roundtrip through the full reverse
/// pipeline.
#[test]
fn enveloped_roundtrip_gzip_aes() {
    let mut keys = StaticKeyStore::new();
    let fingerprint = keys.insert([0x21u8; 32]);
    let env = TestEnv::with_key_store("enveloped_roundtrip_gzip_aes", 256, keys);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    let payload: Vec<u8> = (0..300_000).map(|n| ((n / 100) % 256) as u8).collect();
    env.write_source_file(&source, "big.bin", &payload);
    env.write_source_file(&source, "small.txt", b"hello envelope");

    let (job, source_row) = env.create_job(
        "J-env",
        &source,
        BackupType::Full,
        Compression::Gzip,
        Some(&fingerprint),
    );
    let execution = env.run_backup(&job, &source_row);
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let set = env
        .ctx
        .catalog
        .lookup_set(execution.backup_set_id.unwrap())
        .unwrap();
    assert!(set.encrypted);

    env.load_tape("LBL001");
    let destination = env.dir.join("restored");
    restore_all(&env, set.id, &destination, false);
    assert_eq!(std::fs::read(destination.join("big.bin")).unwrap(), payload);
    assert_eq!(
        std::fs::read(destination.join("small.txt")).unwrap(),
        b"hello envelope"
    );
}

#[test]
fn enveloped_roundtrip_zstd() {
    let env = TestEnv::new("enveloped_roundtrip_zstd", 256);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    let payload: Vec<u8> = (0..200_000).map(|n| (n % 251) as u8).collect();
    env.write_source_file(&source, "data.bin", &payload);

    let (job, source_row) =
        env.create_job("J-zstd", &source, BackupType::Full, Compression::Zstd, None);
    let execution = env.run_backup(&job, &source_row);
    assert_eq!(execution.status, ExecutionStatus::Completed);

    env.load_tape("LBL001");
    let destination = env.dir.join("restored");
    restore_all(&env, execution.backup_set_id.unwrap(), &destination, false);
    assert_eq!(std::fs::read(destination.join("data.bin")).unwrap(), payload);
}

/// Per-file envelopes stay individually seekable: a selective restore
/// of an encrypted set works without reading the whole stream.
#[test]
fn per_file_encryption_selective_restore() {
    let mut keys = StaticKeyStore::new();
    let fingerprint = keys.insert([0x44u8; 32]);
    let env = TestEnv::with_key_store("per_file_selective_restore", 256, keys);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    env.write_source_file(&source, "one.bin", &vec![1u8; 30_000]);
    env.write_source_file(&source, "two.bin", &vec![2u8; 40_000]);
    env.write_source_file(&source, "three.bin", &vec![3u8; 50_000]);

    let source_row = env
        .ctx
        .jobs
        .create_source(source.to_str().unwrap(), tba_api_types::SourceType::Local, &[], &[])
        .unwrap();
    let job = env
        .ctx
        .jobs
        .create_job(
            "J-pf",
            source_row.id,
            env.pool.id,
            BackupType::Full,
            "0 0 2 * * *",
            30,
            Some(&fingerprint),
            true,
            Compression::None,
        )
        .unwrap();

    let execution = env.run_backup(&job, &source_row);
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let set = env
        .ctx
        .catalog
        .lookup_set(execution.backup_set_id.unwrap())
        .unwrap();
    assert!(set.encrypted);

    // catalog records plaintext names and sizes
    let entries = env.ctx.catalog.browse(set.id, "").unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().any(|e| e.file_path == "two.bin" && e.file_size == 40_000));

    env.load_tape("LBL001");
    let destination = env.dir.join("restored");
    let request = RestoreRequest {
        set_id: set.id,
        paths: vec!["two.bin".to_string()],
        prefixes: Vec::new(),
        destination: destination.clone(),
        verify: true,
        overwrite: false,
    };
    let execution_id = env.supervisor.submit_restore(request, &env.drive).unwrap();
    assert!(env
        .supervisor
        .wait_for(execution_id, Duration::from_secs(30)));
    let execution = env.ctx.executions.get_execution(execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.files_processed, 1);
    assert_eq!(
        std::fs::read(destination.join("two.bin")).unwrap(),
        vec![2u8; 40_000]
    );
    assert!(!destination.join("one.bin").exists());
}

/// Combining per-file encryption with compression is refused.
#[test]
fn per_file_encryption_rejects_compression() {
    let env = TestEnv::new("per_file_rejects_compression", 64);
    let source = env.source_dir("data");
    let source_row = env
        .ctx
        .jobs
        .create_source(source.to_str().unwrap(), tba_api_types::SourceType::Local, &[], &[])
        .unwrap();
    assert!(env
        .ctx
        .jobs
        .create_job(
            "J-bad",
            source_row.id,
            env.pool.id,
            BackupType::Full,
            "0 0 2 * * *",
            30,
            Some("cafe"),
            true,
            Compression::Gzip,
        )
        .is_err());
}

/// Pausing and resuming mid-run produces the same set as an
/// uninterrupted run.
#[test]
fn pause_resume_is_deterministic() {
    let build_source = |env: &TestEnv| {
        let source = env.source_dir("data");
        env.write_source_file(&source, "a-first.bin", &vec![0x11; BLOCK_SIZE * 16]);
        for i in 0..40 {
            env.write_source_file(
                &source,
                &format!("file{:02}.bin", i),
                &vec![(i * 3) as u8; 10_000],
            );
        }
        source
    };

    // reference: uninterrupted
    let env_a = TestEnv::new("pause_determinism_reference", 4096);
    env_a.add_labeled_tape("LBL001", TAPE_CAPACITY);
    let source_a = build_source(&env_a);
    let (job_a, source_row_a) =
        env_a.create_job("J-ref", &source_a, BackupType::Full, Compression::None, None);
    let reference = env_a.run_backup(&job_a, &source_row_a);
    let reference_set = env_a
        .ctx
        .catalog
        .lookup_set(reference.backup_set_id.unwrap())
        .unwrap();

    // paused and resumed
    let env_b = TestEnv::new("pause_determinism_paused", 4096);
    env_b.add_labeled_tape("LBL001", TAPE_CAPACITY);
    let source_b = build_source(&env_b);
    let (job_b, source_row_b) =
        env_b.create_job("J-ref", &source_b, BackupType::Full, Compression::None, None);
    let execution_id = env_b.submit_backup(&job_b, &source_row_b);

    assert!(env_b.wait_until(
        || env_b
            .supervisor
            .snapshot(execution_id)
            .map(|snapshot| snapshot.file_count >= 1)
            .unwrap_or(false),
        Duration::from_secs(30),
    ));
    env_b.supervisor.pause(execution_id).unwrap();
    assert!(env_b.wait_until(
        || env_b
            .ctx
            .executions
            .get_execution(execution_id)
            .map(|execution| execution.status == ExecutionStatus::Paused)
            .unwrap_or(false),
        Duration::from_secs(30),
    ));
    env_b.supervisor.resume(execution_id).unwrap();
    assert!(env_b
        .supervisor
        .wait_for(execution_id, Duration::from_secs(60)));

    let paused = env_b.ctx.executions.get_execution(execution_id).unwrap();
    assert_eq!(paused.status, ExecutionStatus::Completed);
    let paused_set = env_b
        .ctx
        .catalog
        .lookup_set(paused.backup_set_id.unwrap())
        .unwrap();

    assert_eq!(paused_set.file_count, reference_set.file_count);
    assert_eq!(paused_set.total_bytes, reference_set.total_bytes);
    assert_eq!(paused_set.checksum, reference_set.checksum);
    assert_eq!(paused_set.end_block, reference_set.end_block);
}

/// Tape usage equals the set stream size within block padding.
#[test]
fn tape_usage_tracks_stream_within_padding() {
    let env = TestEnv::new("tape_usage_padding", 512);
    let tape = env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    for i in 0..5 {
        env.write_source_file(&source, &format!("f{}.bin", i), &vec![i as u8; 50_000]);
    }
    let (job, source_row) =
        env.create_job("J-usage", &source, BackupType::Full, Compression::None, None);
    let execution = env.run_backup(&job, &source_row);
    let set = env
        .ctx
        .catalog
        .lookup_set(execution.backup_set_id.unwrap())
        .unwrap();

    let tape = env.ctx.registry.lookup_tape(tape.id).unwrap();
    assert!(tape.used_bytes >= set.total_bytes);
    // tolerance: tar overhead plus per-file block padding stays within
    // two block sizes per file
    let tolerance = (set.file_count + 2) * 2 * BLOCK_SIZE as u64;
    assert!(tape.used_bytes <= set.total_bytes + tolerance);
    assert_eq!(tape.write_count, 1);
}

/// overwrite=false skips existing destination files without failing
/// the run.
#[test]
fn restore_skips_existing_without_overwrite() {
    let env = TestEnv::new("restore_skip_existing", 128);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    env.write_source_file(&source, "keep.txt", b"from tape");
    env.write_source_file(&source, "fresh.txt", b"fresh from tape");

    let (job, source_row) =
        env.create_job("J-skip", &source, BackupType::Full, Compression::None, None);
    let execution = env.run_backup(&job, &source_row);
    let set_id = execution.backup_set_id.unwrap();

    let destination = env.dir.join("restored");
    std::fs::create_dir_all(&destination).unwrap();
    std::fs::write(destination.join("keep.txt"), b"local version").unwrap();

    env.load_tape("LBL001");
    let request = RestoreRequest {
        set_id,
        paths: Vec::new(),
        prefixes: Vec::new(),
        destination: destination.clone(),
        verify: false,
        overwrite: false,
    };
    let execution_id = env.supervisor.submit_restore(request, &env.drive).unwrap();
    assert!(env
        .supervisor
        .wait_for(execution_id, Duration::from_secs(30)));
    let execution = env.ctx.executions.get_execution(execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    // existing file untouched, missing file restored
    assert_eq!(
        std::fs::read(destination.join("keep.txt")).unwrap(),
        b"local version"
    );
    assert_eq!(
        std::fs::read(destination.join("fresh.txt")).unwrap(),
        b"fresh from tape"
    );
}

/// Folder prefixes expand through the catalog.
#[test]
fn restore_by_prefix() {
    let env = TestEnv::new("restore_by_prefix", 128);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    env.write_source_file(&source, "etc/passwd", b"root:x:0:0");
    env.write_source_file(&source, "etc/ssh/sshd_config", b"Port 22");
    env.write_source_file(&source, "var/log/syslog", b"noise");

    let (job, source_row) =
        env.create_job("J-prefix", &source, BackupType::Full, Compression::None, None);
    let execution = env.run_backup(&job, &source_row);
    let set_id = execution.backup_set_id.unwrap();

    // the rollup feeds the restore tree view
    let children = env.ctx.catalog.directory_rollup(set_id, "").unwrap();
    assert_eq!(children, vec!["etc/".to_string(), "var/".to_string()]);

    env.load_tape("LBL001");
    let destination = env.dir.join("restored");
    let request = RestoreRequest {
        set_id,
        paths: Vec::new(),
        prefixes: vec!["etc/".to_string()],
        destination: destination.clone(),
        verify: true,
        overwrite: false,
    };
    let execution_id = env.supervisor.submit_restore(request, &env.drive).unwrap();
    assert!(env
        .supervisor
        .wait_for(execution_id, Duration::from_secs(30)));
    let execution = env.ctx.executions.get_execution(execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.files_processed, 2);
    assert!(destination.join("etc/passwd").exists());
    assert!(destination.join("etc/ssh/sshd_config").exists());
    assert!(!destination.join("var").exists());
}

/// Incremental runs pick up changed and new files only, and chain to
/// their parent.
#[test]
fn incremental_chain_carries_changes() {
    let env = TestEnv::new("incremental_chain", 256);
    env.add_labeled_tape("LBL001", TAPE_CAPACITY);

    let source = env.source_dir("data");
    env.write_source_file(&source, "stable.txt", b"never changes");
    env.write_source_file(&source, "mutable.txt", b"version 1");

    let (job, source_row) =
        env.create_job("J-inc", &source, BackupType::Full, Compression::None, None);
    let full = env.run_backup(&job, &source_row);
    let full_set = full.backup_set_id.unwrap();

    // grow one file, add another
    env.write_source_file(&source, "mutable.txt", b"version 2 is longer");
    env.write_source_file(&source, "added.txt", b"new file");

    let mut job = env.ctx.jobs.get_job(job.id).unwrap();
    job.backup_type = BackupType::Incremental;
    let incremental = env.run_backup(&job, &source_row);

    let set = env
        .ctx
        .catalog
        .lookup_set(incremental.backup_set_id.unwrap())
        .unwrap();
    assert_eq!(set.status, SetStatus::Completed);
    assert_eq!(set.parent_set_id, Some(full_set));

    let mut paths: Vec<String> = env
        .ctx
        .catalog
        .browse(set.id, "")
        .unwrap()
        .into_iter()
        .map(|entry| entry.file_path)
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["added.txt".to_string(), "mutable.txt".to_string()]);
}
