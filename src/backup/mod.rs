//! Backup engine.
//!
//! Drives one plan end to end through the phases
//! `initializing -> scanning -> streaming -> (verifying) -> cataloging ->
//! completed`, emitting progress events along the way. Tape-full
//! spanning, block-write retries and the operator tape-change protocol
//! live below the pipeline in [`MediaWriter`]; cancel and pause land at
//! file boundaries here.

mod planner;
pub use planner::*;

mod pipeline;
pub use pipeline::*;

mod media;
pub use media::*;

use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Context, Error};
use flate2::write::GzEncoder;

use tba_api_types::{
    CatalogEntry, ChangeReason, ChangeRequestStatus, Compression, ExecutionPhase,
    ExecutionStatus, Id, ResumeState, SetStatus, SpanningStatus, Tape,
};
use tba_tape::DeviceSession;

use crate::catalog::SetTotals;
use crate::config::DriveConfig;
use crate::restore::stream::{demux_aligned, demux_sequential, AlignedTarget};
use crate::server::{
    ExecutionContext, PauseOutcome, ProgressTracker, TaskControl,
};
use crate::tape::open_session;

/// Catalog entries are appended in batches of this size.
const APPEND_BATCH: usize = 128;

/// Outcome of one engine run.
pub struct BackupOutcome {
    pub set_id: Id,
    pub status: ExecutionStatus,
    pub files_written: u64,
    pub bytes_written: u64,
    pub volumes: usize,
}

struct StreamLoop {
    entries: Vec<CatalogEntry>,
    appended: usize,
    chain: [u8; 32],
    cancelled: bool,
}

/// Roll the set checksum: `chain = sha256(chain || file_digest)`.
///
/// The chain value is resumable, which is why it is not a plain running
/// hash over the stream.
fn chain_update(chain: &[u8; 32], digest: &[u8; 32]) -> [u8; 32] {
    let mut hasher = openssl::sha::Sha256::new();
    hasher.update(chain);
    hasher.update(digest);
    hasher.finish()
}

/// Reader serving exactly `size` bytes.
///
/// Files may shrink between scan and stream; the tar header already
/// promised a size, so a short source is zero-padded (and logged by the
/// caller via the returned flag).
struct SizedReader<R> {
    inner: R,
    remaining: u64,
    padded: bool,
}

impl<R: Read> SizedReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
            padded: false,
        }
    }

    fn was_padded(&self) -> bool {
        self.padded
    }
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = (self.remaining).min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            // source shrank, keep the promised size
            self.padded = true;
            buf[..want].fill(0);
            self.remaining -= want as u64;
            return Ok(want);
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Reader wrapping the source file: cancel checks, byte accounting and
/// throttled progress publishes on every chunk.
struct ControlledReader<'a, R> {
    inner: R,
    engine: &'a BackupEngine,
}

impl<R: Read> Read for ControlledReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.engine.control.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "task cancelled",
            ));
        }
        let n = self.inner.read(buf)?;
        self.engine.tracker.add_bytes(n as u64);
        if self.engine.tracker.publish_due() {
            self.engine
                .ctx
                .events
                .publish(self.engine.tracker.snapshot());
        }
        Ok(n)
    }
}

pub struct BackupEngine {
    ctx: Arc<ExecutionContext>,
    execution_id: Id,
    control: TaskControl,
    tracker: Arc<ProgressTracker>,
}

impl BackupEngine {
    pub fn new(
        ctx: Arc<ExecutionContext>,
        execution_id: Id,
        control: TaskControl,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            ctx,
            execution_id,
            control,
            tracker,
        }
    }

    fn phase(&self, phase: ExecutionPhase) {
        self.tracker.set_phase(phase);
        self.ctx.events.publish(self.tracker.snapshot());
    }

    /// Execute one plan.
    pub fn run(&self, plan: &BackupPlan, drive: &DriveConfig) -> Result<BackupOutcome, Error> {
        self.tracker.set_totals(plan.total_files, plan.estimated_total_bytes);
        self.tracker.set_tape_label(&plan.tape.label);
        self.phase(ExecutionPhase::Initializing);
        self.tracker.log(format!(
            "starting {} backup of job '{}' to tape '{}'",
            plan.backup_type, plan.job.name, plan.tape.label
        ));

        // refuse early when the encryption key is not resolvable
        let key = match &plan.job.encryption_key_fingerprint {
            Some(fingerprint) => Some(require_key(self.ctx.key_store.as_ref(), fingerprint)?),
            None => None,
        };

        let block_size = self.ctx.config.tape.block_size;
        let mut session = open_session(drive, &self.ctx.lock_dir(), block_size)?;

        // the loaded tape must be the planned one
        let tape = match self.ctx.registry.verify_loaded_tape(&mut session, plan.tape.id)? {
            Ok(tape) => tape,
            Err(actual) => {
                let actual_label = actual
                    .map(|tape| tape.label)
                    .unwrap_or_else(|| "unlabeled media".to_string());
                self.tracker.log(format!(
                    "wrong tape loaded: expected '{}', found '{}'",
                    plan.tape.label, actual_label
                ));
                bail!(
                    "wrong tape in drive '{}': expected '{}', found '{}'",
                    drive.device_path,
                    plan.tape.label,
                    actual_label
                );
            }
        };

        // append behind existing data, blank tapes start at the data
        // region (reading the label left us there)
        if tape.used_bytes > 0 {
            session.move_to_eom()?;
        }
        let start_block = session.position()?;

        let set = self.ctx.catalog.create_set(
            plan.job.id,
            tape.id,
            plan.parent_set_id,
            plan.backup_type,
            key.is_some(),
        )?;
        self.ctx.executions.set_backup_set(self.execution_id, set.id)?;

        let set_id = set.id;
        self.run_set(plan, drive, session, &tape, start_block, key, set_id)
            .map_err(|err| {
                // a run that dies after set creation must not leave the
                // row in running state
                let _ = self.ctx.catalog.mark_failed(set_id);
                err
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_set(
        &self,
        plan: &BackupPlan,
        drive: &DriveConfig,
        session: DeviceSession,
        tape: &Tape,
        start_block: u64,
        key: Option<[u8; 32]>,
        set_id: Id,
    ) -> Result<BackupOutcome, Error> {
        let block_size = self.ctx.config.tape.block_size;

        self.phase(ExecutionPhase::Scanning);
        self.ctx.catalog.mark_running(set_id, start_block)?;
        self.tracker.log(format!(
            "scan found {} files, {} bytes, writing from block {}",
            plan.total_files, plan.estimated_total_bytes, start_block
        ));

        self.phase(ExecutionPhase::Streaming);

        let span_state = Arc::new(Mutex::new(SpanBookkeeping::default()));
        let provider = EngineVolumeProvider {
            ctx: self.ctx.clone(),
            control: self.control.clone(),
            tracker: self.tracker.clone(),
            execution_id: self.execution_id,
            drive: drive.clone(),
            block_size,
            set_id,
            span: span_state.clone(),
        };

        let writer = MediaWriter::new(
            session,
            tape.id,
            &tape.label,
            Box::new(provider),
            self.control.clone(),
            self.ctx.config.tape.write_retries,
        )?;
        let handle = writer.clone();

        let per_file = plan.job.per_file_encryption && key.is_some();
        if per_file && plan.job.compression != Compression::None {
            bail!("per-file encryption cannot be combined with compression");
        }
        // per-file envelopes keep every entry independently seekable
        let aligned = plan.job.compression == Compression::None && (key.is_none() || per_file);

        let lp = match (plan.job.compression, key) {
            (Compression::None, None) => {
                self.run_tar(writer, plan, set_id, &handle, aligned, None)?
            }
            (Compression::None, Some(key)) if per_file => {
                self.run_tar(writer, plan, set_id, &handle, aligned, Some(key))?
            }
            (Compression::Gzip, None) => {
                let gz = GzEncoder::new(writer, flate2::Compression::default());
                let (lp, gz) = self.run_tar_inner(gz, plan, set_id, &handle)?;
                finish_or_tolerate(lp.cancelled, || gz.map(|gz| gz.finish().map(|_| ())))?;
                lp
            }
            (Compression::Zstd, None) => {
                let zst = zstd::stream::write::Encoder::new(writer, 0)?;
                let (lp, zst) = self.run_tar_inner(zst, plan, set_id, &handle)?;
                finish_or_tolerate(lp.cancelled, || zst.map(|z| z.finish().map(|_| ())))?;
                lp
            }
            (Compression::None, Some(key)) => {
                let crypt = CryptWriter::new(writer, &key)?;
                let (lp, crypt) = self.run_tar_inner(crypt, plan, set_id, &handle)?;
                match crypt {
                    Some(crypt) => {
                        crypt.finish()?;
                    }
                    None if lp.cancelled => {}
                    None => bail!("encryption pipeline lost - internal error"),
                }
                lp
            }
            (Compression::Gzip, Some(key)) => {
                let crypt = CryptWriter::new(writer, &key)?;
                let gz = GzEncoder::new(crypt, flate2::Compression::default());
                let (lp, gz) = self.run_tar_inner(gz, plan, set_id, &handle)?;
                if let Some(gz) = gz {
                    let crypt = gz.finish()?;
                    crypt.finish()?;
                } else if !lp.cancelled {
                    bail!("compression pipeline lost - internal error");
                }
                lp
            }
            (Compression::Zstd, Some(key)) => {
                let crypt = CryptWriter::new(writer, &key)?;
                let zst = zstd::stream::write::Encoder::new(crypt, 0)?;
                let (lp, zst) = self.run_tar_inner(zst, plan, set_id, &handle)?;
                if let Some(zst) = zst {
                    let crypt = zst.finish()?;
                    crypt.finish()?;
                } else if !lp.cancelled {
                    bail!("compression pipeline lost - internal error");
                }
                lp
            }
        };

        let finished = handle.finish()?;
        let mut session = finished.session;

        // optional read-back before cataloging
        if self.ctx.config.tape.verify_after_write && !lp.cancelled {
            if finished.volumes.len() == 1 {
                self.phase(ExecutionPhase::Verifying);
                self.verify_written(
                    &mut session,
                    start_block,
                    &lp.entries,
                    plan.job.compression,
                    plan.job.encryption_key_fingerprint.as_deref(),
                    per_file,
                    finished.stream_bytes,
                    block_size,
                    aligned,
                )?;
                self.tracker.log("read-back verification passed");
            } else {
                self.tracker
                    .log("skipping read-back verification for multi-volume set");
            }
        }

        self.phase(ExecutionPhase::Cataloging);

        // remaining entries of the last batch
        self.ctx
            .catalog
            .append_entries(set_id, &lp.entries[lp.appended..])?;

        let last = finished
            .volumes
            .last()
            .ok_or_else(|| format_err!("stream finished without volumes - internal error"))?;

        let status = if lp.cancelled {
            SetStatus::Cancelled
        } else {
            SetStatus::Completed
        };
        let totals = SetTotals {
            end_block: finished.end_block,
            checksum: hex::encode(lp.chain),
            stream_bytes: finished.stream_bytes,
            device_bytes: last.device_bytes,
            usage_tape_id: last.tape_id,
            mark_tape_full: finished.leom,
        };
        // snapshots of cancelled runs must not serve as incremental
        // parents
        let snapshot = if lp.cancelled { &[][..] } else { &plan.snapshot[..] };
        let set = self.ctx.catalog.finalize_set(set_id, status, &totals, snapshot)?;

        let span = span_state.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(spanning_set_id) = span.spanning_set_id {
            let spanning_status = if lp.cancelled {
                SpanningStatus::Failed
            } else {
                SpanningStatus::Completed
            };
            self.ctx
                .catalog
                .finalize_spanning_set(spanning_set_id, spanning_status)?;
        }
        drop(span);

        // terminate the set region and release the drive
        drop(session);

        let (files, bytes) = self.tracker.counters();
        self.ctx
            .executions
            .update_counters(self.execution_id, files, bytes)?;

        let execution_status = if lp.cancelled {
            self.tracker.log("backup cancelled, tape remains readable");
            self.phase(ExecutionPhase::Cancelled);
            ExecutionStatus::Cancelled
        } else {
            self.tracker.log(format!(
                "backup completed: {} files, {} bytes, {} volume(s)",
                set.file_count, set.total_bytes, finished.volumes.len()
            ));
            self.phase(ExecutionPhase::Completed);
            ExecutionStatus::Completed
        };

        Ok(BackupOutcome {
            set_id: set.id,
            status: execution_status,
            files_written: files,
            bytes_written: bytes,
            volumes: finished.volumes.len(),
        })
    }

    fn run_tar(
        &self,
        stack: MediaWriter,
        plan: &BackupPlan,
        set_id: Id,
        handle: &MediaWriter,
        aligned: bool,
        per_file_key: Option<[u8; 32]>,
    ) -> Result<StreamLoop, Error> {
        let mut tar = tar::Builder::new(stack);
        let lp = self.stream_files(&mut tar, plan, set_id, handle, aligned, per_file_key)?;
        match tar.into_inner() {
            Ok(_) => {}
            Err(err) if lp.cancelled => {
                self.tracker
                    .log(format!("archive terminator skipped after cancel ({})", err));
            }
            Err(err) => return Err(err).context("finishing tar stream"),
        }
        Ok(lp)
    }

    /// Like [`Self::run_tar`], returning the inner writer for stacked
    /// pipelines (None when the cancel path broke the terminator).
    fn run_tar_inner<W: Write>(
        &self,
        stack: W,
        plan: &BackupPlan,
        set_id: Id,
        handle: &MediaWriter,
    ) -> Result<(StreamLoop, Option<W>), Error> {
        let mut tar = tar::Builder::new(stack);
        // enveloped pipelines are never aligned
        let lp = self.stream_files(&mut tar, plan, set_id, handle, false, None)?;
        match tar.into_inner() {
            Ok(inner) => Ok((lp, Some(inner))),
            Err(err) if lp.cancelled => {
                self.tracker
                    .log(format!("archive terminator skipped after cancel ({})", err));
                Ok((lp, None))
            }
            Err(err) => Err(err).context("finishing tar stream"),
        }
    }

    fn stream_files<W: Write>(
        &self,
        tar: &mut tar::Builder<W>,
        plan: &BackupPlan,
        set_id: Id,
        handle: &MediaWriter,
        aligned: bool,
        per_file_key: Option<[u8; 32]>,
    ) -> Result<StreamLoop, Error> {
        let mut lp = StreamLoop {
            entries: Vec::new(),
            appended: 0,
            chain: [0u8; 32],
            cancelled: false,
        };

        for index in 0..plan.files.len() {
            // suspension point: cancellation
            if self.control.is_cancelled() {
                lp.cancelled = true;
                return Ok(lp);
            }
            // suspension point: pause lands on the file boundary
            if self.control.is_paused() {
                match self.enter_pause(index as u64, plan, &lp)? {
                    PauseOutcome::Resumed => {}
                    PauseOutcome::Cancelled => {
                        lp.cancelled = true;
                        return Ok(lp);
                    }
                }
            }

            let meta = match plan.files.meta(index) {
                Ok(meta) => meta,
                Err(err) => {
                    self.tracker
                        .log(format!("skipping vanished file (index {}): {}", index, err));
                    continue;
                }
            };

            if aligned {
                // every entry starts on a device block
                handle.flush_block()?;
            }
            let block_offset = handle.current_block();
            handle.note_file_index(index as u64);
            self.tracker.file_start();

            let file = match File::open(&meta.abs_path) {
                Ok(file) => file,
                Err(err) => {
                    self.tracker
                        .log(format!("skipping unreadable '{}': {}", meta.rel_path, err));
                    continue;
                }
            };

            let sized = SizedReader::new(
                ControlledReader {
                    inner: file,
                    engine: self,
                },
                meta.size,
            );
            let reader = ChecksumReader::new(sized);

            let mut header = tar::Header::new_gnu();
            header.set_mode(meta.mode);
            header.set_mtime(meta.mtime.timestamp().max(0) as u64);

            let reader = match per_file_key {
                Some(key) => {
                    // independent AEAD envelope per entry
                    header.set_size(meta.size + ENVELOPE_OVERHEAD);
                    let wire_path = format!("{}{}", meta.rel_path, ENCRYPTED_FILE_SUFFIX);
                    let mut envelope = EnvelopeReader::new(reader, &key)?;
                    match tar.append_data(&mut header, &wire_path, &mut envelope) {
                        Ok(()) => {}
                        Err(_) if self.control.is_cancelled() => {
                            lp.cancelled = true;
                            return Ok(lp);
                        }
                        Err(err) => {
                            return Err(err)
                                .context(format!("writing '{}' to tape", meta.rel_path))
                        }
                    }
                    envelope.into_inner()
                }
                None => {
                    header.set_size(meta.size);
                    let mut reader = reader;
                    match tar.append_data(&mut header, &meta.rel_path, &mut reader) {
                        Ok(()) => {}
                        Err(_) if self.control.is_cancelled() => {
                            lp.cancelled = true;
                            return Ok(lp);
                        }
                        Err(err) => {
                            return Err(err)
                                .context(format!("writing '{}' to tape", meta.rel_path))
                        }
                    }
                    reader
                }
            };

            let (sized, digest, _) = reader.finish();
            if sized.was_padded() {
                self.tracker.log(format!(
                    "'{}' shrank while reading, padded to scanned size",
                    meta.rel_path
                ));
            }

            lp.chain = chain_update(&lp.chain, &digest);
            lp.entries.push(CatalogEntry {
                backup_set_id: set_id,
                file_path: meta.rel_path.clone(),
                file_size: meta.size,
                file_mode: meta.mode,
                mod_time: meta.mtime,
                checksum: hex::encode(digest),
                block_offset,
            });
            self.tracker.file_done();

            if lp.entries.len() - lp.appended >= APPEND_BATCH {
                self.ctx
                    .catalog
                    .append_entries(set_id, &lp.entries[lp.appended..])?;
                lp.appended = lp.entries.len();
                let (files, bytes) = self.tracker.counters();
                self.ctx
                    .executions
                    .update_counters(self.execution_id, files, bytes)?;
            }
        }

        Ok(lp)
    }

    /// Pause protocol at a file boundary: persist resume state, park
    /// until resumed or cancelled.
    fn enter_pause(
        &self,
        file_index: u64,
        plan: &BackupPlan,
        lp: &StreamLoop,
    ) -> Result<PauseOutcome, Error> {
        let resume = ResumeState {
            file_index,
            byte_offset: 0,
            running_checksum: hex::encode(lp.chain),
            source_order_cursor: plan.files.len() as u64,
        };
        self.ctx
            .executions
            .save_resume_state(self.execution_id, Some(&resume))?;
        self.ctx
            .executions
            .set_status(self.execution_id, ExecutionStatus::Paused)?;
        self.tracker.set_status(ExecutionStatus::Paused);
        self.phase(ExecutionPhase::Paused {
            reason: "operator".to_string(),
        });
        self.tracker
            .log(format!("paused at file boundary (index {})", file_index));

        let outcome = self.control.wait_while_paused();
        if outcome == PauseOutcome::Resumed {
            self.ctx
                .executions
                .set_status(self.execution_id, ExecutionStatus::Running)?;
            self.tracker.set_status(ExecutionStatus::Running);
            self.phase(ExecutionPhase::Streaming);
            self.tracker.log("resumed");
        }
        Ok(outcome)
    }

    /// Opt-in read-back pass between streaming and cataloging.
    #[allow(clippy::too_many_arguments)]
    fn verify_written(
        &self,
        session: &mut DeviceSession,
        start_block: u64,
        entries: &[CatalogEntry],
        compression: Compression,
        key_fingerprint: Option<&str>,
        per_file: bool,
        stream_bytes: u64,
        block_size: usize,
        aligned: bool,
    ) -> Result<(), Error> {
        session.seek_block(start_block)?;

        let per_file_key = match (per_file, key_fingerprint) {
            (true, Some(fingerprint)) => {
                Some(require_key(self.ctx.key_store.as_ref(), fingerprint)?)
            }
            _ => None,
        };

        let verify_sink = |entry: &CatalogEntry, reader: &mut dyn Read| -> Result<(), Error> {
            // wire entries of per-file sets carry the envelope suffix
            let (original_path, original_size, checksum) = match entry
                .file_path
                .strip_suffix(ENCRYPTED_FILE_SUFFIX)
            {
                Some(path) if per_file_key.is_some() => (
                    path.to_string(),
                    entry.file_size - ENVELOPE_OVERHEAD,
                    entry.checksum.clone(),
                ),
                _ => (entry.file_path.clone(), entry.file_size, entry.checksum.clone()),
            };
            let mut decrypted;
            let reader: &mut dyn Read = match &per_file_key {
                Some(key) => {
                    decrypted = CryptReader::new(reader, key, entry.file_size)?;
                    &mut decrypted
                }
                None => reader,
            };

            let mut hasher = openssl::sha::Sha256::new();
            let mut buffer = [0u8; 64 * 1024];
            let mut total = 0u64;
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
                total += n as u64;
            }
            if total != original_size {
                bail!(
                    "verify: size mismatch for '{}' ({} != {})",
                    original_path,
                    total,
                    original_size
                );
            }
            let digest = hex::encode(hasher.finish());
            if digest != checksum {
                bail!("verify: checksum mismatch for '{}'", original_path);
            }
            Ok(())
        };

        if aligned {
            let reader = session.read_stream(None)?;
            let mut targets: Vec<AlignedTarget> = entries
                .iter()
                .map(|entry| {
                    let mut wire = entry.clone();
                    if per_file_key.is_some() {
                        wire.file_path =
                            format!("{}{}", wire.file_path, ENCRYPTED_FILE_SUFFIX);
                        wire.file_size += ENVELOPE_OVERHEAD;
                    }
                    AlignedTarget {
                        stream_pos: (entry.block_offset - start_block) * block_size as u64,
                        entry: wire,
                    }
                })
                .collect();
            targets.sort_by_key(|t| t.stream_pos);
            demux_aligned(reader, &targets, verify_sink)?;
        } else {
            let reader = session.read_stream(Some(stream_bytes))?;
            let wanted: std::collections::HashMap<String, CatalogEntry> = entries
                .iter()
                .map(|entry| (entry.file_path.clone(), entry.clone()))
                .collect();

            match (compression, key_fingerprint) {
                (Compression::None, None) => {
                    demux_sequential(reader, &wanted, verify_sink)?;
                }
                (compression, fingerprint) => {
                    let decoded: Box<dyn Read> = match fingerprint {
                        Some(fingerprint) => {
                            let key = require_key(self.ctx.key_store.as_ref(), fingerprint)?;
                            Box::new(CryptReader::new(reader, &key, stream_bytes)?)
                        }
                        None => Box::new(reader),
                    };
                    let decompressed: Box<dyn Read> = match compression {
                        Compression::None => decoded,
                        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(decoded)),
                        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(decoded)?),
                    };
                    demux_sequential(decompressed, &wanted, verify_sink)?;
                }
            }
        }
        Ok(())
    }
}

fn finish_or_tolerate<E: std::error::Error + Send + Sync + 'static>(
    cancelled: bool,
    finish: impl FnOnce() -> Option<Result<(), E>>,
) -> Result<(), Error> {
    match finish() {
        Some(Ok(())) => Ok(()),
        Some(Err(err)) if cancelled => {
            log::warn!("pipeline flush after cancel failed: {}", err);
            Ok(())
        }
        Some(Err(err)) => Err(err.into()),
        None if cancelled => Ok(()),
        None => bail!("pipeline lost its writer - internal error"),
    }
}

#[derive(Default)]
struct SpanBookkeeping {
    spanning_set_id: Option<Id>,
    open_member_id: Option<Id>,
    next_sequence: u32,
}

/// Engine-side volume provider: spanning records, registry updates,
/// the tape change request protocol and the operator wait.
struct EngineVolumeProvider {
    ctx: Arc<ExecutionContext>,
    control: TaskControl,
    tracker: Arc<ProgressTracker>,
    execution_id: Id,
    drive: DriveConfig,
    block_size: usize,
    set_id: Id,
    span: Arc<Mutex<SpanBookkeeping>>,
}

impl EngineVolumeProvider {
    fn span(&self) -> std::sync::MutexGuard<'_, SpanBookkeeping> {
        self.span.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Wait until the expected tape is loaded and return a positioned
    /// session.
    fn acquire_tape(&self, tape: &Tape) -> Result<(DeviceSession, u64), Error> {
        loop {
            self.control.check_cancelled()?;
            match open_session(&self.drive, &self.ctx.lock_dir(), self.block_size) {
                Ok(mut session) => {
                    match self.ctx.registry.verify_loaded_tape(&mut session, tape.id)? {
                        Ok(loaded) => {
                            if loaded.used_bytes > 0 {
                                session.move_to_eom()?;
                            }
                            let start_block = session.position()?;
                            return Ok((session, start_block));
                        }
                        Err(actual) => {
                            let found = actual
                                .map(|t| t.label)
                                .unwrap_or_else(|| "unlabeled media".to_string());
                            self.tracker.log(format!(
                                "waiting for tape '{}' (drive has '{}')",
                                tape.label, found
                            ));
                        }
                    }
                }
                Err(err) => {
                    self.tracker
                        .log(format!("drive not ready for '{}': {}", tape.label, err));
                }
            }
            if !self.control.sleep(std::time::Duration::from_secs(1)) {
                bail!("task cancelled");
            }
        }
    }
}

impl VolumeProvider for EngineVolumeProvider {
    fn next_volume(
        &mut self,
        reason: ChangeReason,
        finished: &VolumeUsage,
    ) -> Result<NextVolume, Error> {
        let catalog = &self.ctx.catalog;
        let registry = &self.ctx.registry;

        // spanning bookkeeping: lazily created when the first tape fills
        {
            let mut span = self.span();
            if span.spanning_set_id.is_none() {
                let spanning = catalog.create_spanning_set(self.set_id)?;
                let first = catalog.add_spanning_member(
                    spanning.id,
                    finished.tape_id,
                    1,
                    finished.start_block,
                    finished.files_start_index,
                )?;
                span.spanning_set_id = Some(spanning.id);
                span.open_member_id = Some(first.id);
                span.next_sequence = 2;
            }
            if let Some(member_id) = span.open_member_id.take() {
                catalog.close_spanning_member(
                    member_id,
                    finished.end_block,
                    finished.stream_bytes,
                    finished.files_end_index,
                )?;
            }
        }

        // the exhausted tape is accounted for right away
        registry.update_usage(finished.tape_id, finished.device_bytes)?;
        match reason {
            ChangeReason::TapeFull => {
                // a blank tape that filled in a single set activates first
                let _ = registry.update_status(finished.tape_id, tba_api_types::TapeStatus::Active);
                registry.update_status(finished.tape_id, tba_api_types::TapeStatus::Full)?;
            }
            ChangeReason::TapeError => {
                registry.update_status(finished.tape_id, tba_api_types::TapeStatus::Error)?;
            }
            ChangeReason::WrongTape => {}
        }

        // park the execution until an operator swaps the cartridge
        let interrupted_file = finished.files_end_index.saturating_sub(1);
        let resume = ResumeState {
            file_index: interrupted_file,
            byte_offset: self.tracker.file_byte_offset(),
            running_checksum: String::new(),
            source_order_cursor: 0,
        };
        self.ctx
            .executions
            .save_resume_state(self.execution_id, Some(&resume))?;

        let request = self.ctx.executions.open_change_request(
            self.execution_id,
            Some(finished.tape_id),
            reason,
        )?;
        self.ctx
            .executions
            .set_status(self.execution_id, ExecutionStatus::Paused)?;
        self.tracker.set_status(ExecutionStatus::Paused);
        self.tracker.set_phase(ExecutionPhase::Paused {
            reason: crate::store::enum_to_sql(&reason),
        });
        self.ctx.events.publish(self.tracker.snapshot());
        self.tracker.log(format!(
            "tape '{}' needs changing ({:?}), waiting for operator",
            finished.tape_label, reason
        ));

        let ack = loop {
            let ack = self.control.wait_tape_change()?;
            if ack.request_id == request.id {
                break ack;
            }
            self.tracker.log(format!(
                "ignoring acknowledgment for stale request {}",
                ack.request_id
            ));
        };

        let tape = registry.lookup_tape(ack.new_tape_id)?;
        let (session, start_block) = self.acquire_tape(&tape)?;

        // continuation member
        let member = {
            let mut span = self.span();
            let spanning_set_id = span
                .spanning_set_id
                .ok_or_else(|| format_err!("spanning set vanished - internal error"))?;
            let member = catalog.add_spanning_member(
                spanning_set_id,
                tape.id,
                span.next_sequence,
                start_block,
                finished.files_end_index,
            )?;
            span.next_sequence += 1;
            span.open_member_id = Some(member.id);
            member
        };

        self.ctx
            .executions
            .set_change_request_status(request.id, ChangeRequestStatus::Completed)?;
        self.ctx
            .executions
            .set_status(self.execution_id, ExecutionStatus::Running)?;
        self.tracker.set_status(ExecutionStatus::Running);
        self.tracker.set_tape_label(&tape.label);
        self.tracker.set_phase(ExecutionPhase::Streaming);
        self.ctx.events.publish(self.tracker.snapshot());
        self.tracker.log(format!(
            "continuing on tape '{}' (volume {})",
            tape.label, member.sequence_number
        ));

        Ok(NextVolume {
            session,
            tape_id: tape.id,
            tape_label: tape.label.clone(),
            start_block,
        })
    }

    fn volume_finished(&mut self, last: &VolumeUsage) -> Result<(), Error> {
        let mut span = self.span();
        if let Some(member_id) = span.open_member_id.take() {
            self.ctx.catalog.close_spanning_member(
                member_id,
                last.end_block,
                last.stream_bytes,
                last.files_end_index,
            )?;
        }
        Ok(())
    }
}
