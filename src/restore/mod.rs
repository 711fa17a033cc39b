//! Restore engine.
//!
//! Planning expands folder prefixes through the catalog, groups entries
//! by tape and orders everything so each tape is read with a single
//! forward pass (spanning sets in member-sequence order). Execution
//! streams through the reverse pipeline and demultiplexes per file;
//! the optional verify pass re-reads restored files from disk.

pub(crate) mod stream;

mod media;
pub use media::*;

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use uuid::Uuid;

use tba_api_types::{
    BackupSet, CatalogEntry, ChangeReason, ChangeRequestStatus, Compression, ExecutionPhase,
    ExecutionStatus, Id, Tape,
};
use tba_tape::DeviceSession;

use crate::backup::{require_key, CryptReader};
use crate::catalog::ResolvedEntry;
use crate::config::DriveConfig;
use crate::server::{ExecutionContext, ProgressTracker, TaskControl};
use crate::tape::{open_session, read_media_label};

use self::stream::{demux_aligned, demux_sequential, AlignedTarget};

/// A restore order.
#[derive(Clone, Debug)]
pub struct RestoreRequest {
    pub set_id: Id,
    /// Explicit file paths (source-relative).
    pub paths: Vec<String>,
    /// Folder prefixes, expanded through the catalog.
    pub prefixes: Vec<String>,
    pub destination: PathBuf,
    pub verify: bool,
    pub overwrite: bool,
}

/// One tape's share of a restore, in mount order.
pub struct RestoreVolume {
    pub tape: Tape,
    pub sequence_number: u32,
    /// First block to read on this tape.
    pub read_start_block: u64,
    /// Physical end block of the set region on this tape.
    pub end_block: u64,
    /// Logical stream bytes of this volume (envelope accounting).
    pub stream_bytes: u64,
    /// Wanted entries on this tape, ascending block offset.
    pub entries: Vec<CatalogEntry>,
}

pub struct RestorePlan {
    pub set: BackupSet,
    pub compression: Compression,
    pub encrypted: bool,
    pub volumes: Vec<RestoreVolume>,
    pub total_files: u64,
    pub total_bytes: u64,
}

/// Result of a restore run.
#[derive(Debug, Default)]
pub struct RestoreOutcome {
    pub files_restored: u64,
    pub files_skipped: u64,
    pub bytes_restored: u64,
    /// `Some(all_pass)` when verification was requested.
    pub verified: Option<bool>,
    /// Per-file verification failures (path, reason).
    pub file_errors: Vec<(String, String)>,
}

/// Destination paths must stay below the destination root.
fn sanitize_rel_path(path: &str) -> Result<&Path, Error> {
    let rel = Path::new(path);
    if rel.is_absolute() {
        bail!("catalog path '{}' is absolute", path);
    }
    for component in rel.components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => bail!("catalog path '{}' escapes the destination", path),
        }
    }
    Ok(rel)
}

/// Build the ordered tape/entry plan for a request.
pub fn plan_restore(ctx: &ExecutionContext, request: &RestoreRequest) -> Result<RestorePlan, Error> {
    let set = ctx.catalog.lookup_set(request.set_id)?;
    let job = ctx.jobs.get_job(set.job_id)?;

    // resolve the wanted paths
    let resolved: Vec<ResolvedEntry> = if request.paths.is_empty() && request.prefixes.is_empty() {
        ctx.catalog.resolve_all(set.id)?
    } else {
        let mut paths: Vec<String> = Vec::new();
        for prefix in &request.prefixes {
            for entry in ctx.catalog.browse(set.id, prefix)? {
                paths.push(entry.file_path);
            }
        }
        paths.extend(request.paths.iter().cloned());
        paths.sort();
        paths.dedup();
        if paths.is_empty() {
            bail!("restore request matches no files");
        }
        ctx.catalog.resolve(set.id, &paths)?
    };

    let members = ctx.catalog.spanning_members(set.id)?;

    // group by member sequence, sort within each tape by block offset
    let mut grouped: BTreeMap<u32, Vec<ResolvedEntry>> = BTreeMap::new();
    for entry in resolved {
        grouped.entry(entry.sequence_number).or_default().push(entry);
    }

    let mut volumes = Vec::new();
    let mut total_files = 0u64;
    let mut total_bytes = 0u64;

    if members.is_empty() {
        let entries = grouped.remove(&1).unwrap_or_default();
        let mut entries: Vec<CatalogEntry> = entries.into_iter().map(|r| r.entry).collect();
        entries.sort_by_key(|entry| entry.block_offset);
        if entries.is_empty() {
            bail!("restore request matches no files");
        }
        total_files = entries.len() as u64;
        total_bytes = entries.iter().map(|entry| entry.file_size).sum();

        let enveloped =
            (set.encrypted && !job.per_file_encryption) || job.compression != Compression::None;
        let read_start_block = if enveloped {
            set.start_block
        } else {
            entries[0].block_offset
        };
        volumes.push(RestoreVolume {
            tape: ctx.registry.lookup_tape(set.tape_id)?,
            sequence_number: 1,
            read_start_block,
            end_block: set.end_block,
            stream_bytes: stream_bytes_of(&set, ctx)?,
            entries,
        });
    } else {
        // spanning: every member is mounted in sequence order, the
        // stream is their concatenation
        for member in &members {
            let mut entries: Vec<CatalogEntry> = grouped
                .remove(&member.sequence_number)
                .unwrap_or_default()
                .into_iter()
                .map(|r| r.entry)
                .collect();
            entries.sort_by_key(|entry| entry.block_offset);
            total_files += entries.len() as u64;
            total_bytes += entries.iter().map(|entry| entry.file_size).sum::<u64>();
            volumes.push(RestoreVolume {
                tape: ctx.registry.lookup_tape(member.tape_id)?,
                sequence_number: member.sequence_number,
                read_start_block: member.start_block,
                end_block: member.end_block,
                stream_bytes: member.bytes_written,
                entries,
            });
        }
        if total_files == 0 {
            bail!("restore request matches no files");
        }
    }

    Ok(RestorePlan {
        encrypted: set.encrypted,
        compression: job.compression,
        set,
        volumes,
        total_files,
        total_bytes,
    })
}

fn stream_bytes_of(set: &BackupSet, ctx: &ExecutionContext) -> Result<u64, Error> {
    Ok(ctx.catalog.stream_bytes_of(set.id)?)
}

pub struct RestoreEngine {
    ctx: Arc<ExecutionContext>,
    execution_id: Id,
    control: TaskControl,
    tracker: Arc<ProgressTracker>,
}

impl RestoreEngine {
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

    pub fn run(
        &self,
        request: &RestoreRequest,
        drive: &DriveConfig,
    ) -> Result<RestoreOutcome, Error> {
        self.phase(ExecutionPhase::Initializing);

        let plan = plan_restore(&self.ctx, request)?;
        self.tracker.set_totals(plan.total_files, plan.total_bytes);
        self.tracker.log(format!(
            "restoring {} files ({} bytes) from set {} across {} tape(s)",
            plan.total_files,
            plan.total_bytes,
            plan.set.id,
            plan.volumes.len()
        ));

        let job = self.ctx.jobs.get_job(plan.set.job_id)?;
        let key = if plan.encrypted {
            let fingerprint = job.encryption_key_fingerprint.as_ref().ok_or_else(|| {
                format_err!("set {} is encrypted but its job has no key", plan.set.id)
            })?;
            Some(require_key(self.ctx.key_store.as_ref(), fingerprint)?)
        } else {
            None
        };
        let per_file = plan.encrypted && job.per_file_encryption;

        std::fs::create_dir_all(&request.destination)
            .with_context(|| format!("creating destination {:?}", request.destination))?;

        let enveloped = (plan.encrypted && !per_file) || plan.compression != Compression::None;
        let block_size = self.ctx.config.tape.block_size;

        // volume specs for the media reader
        let specs: Vec<VolumeSpec> = plan
            .volumes
            .iter()
            .map(|volume| VolumeSpec {
                tape_id: volume.tape.id,
                tape_label: volume.tape.label.clone(),
                expected_uuid: volume.tape.uuid,
                start_block: volume.read_start_block,
                limit: if enveloped {
                    Some(volume.stream_bytes)
                } else {
                    Some((volume.end_block - volume.read_start_block) * block_size as u64)
                },
            })
            .collect();

        let mut source = OperatorVolumeSource {
            ctx: self.ctx.clone(),
            control: self.control.clone(),
            tracker: self.tracker.clone(),
            execution_id: self.execution_id,
            drive: drive.clone(),
            block_size,
        };
        let reader = MediaReader::new(specs, &mut source);

        self.phase(ExecutionPhase::Streaming);

        let mut outcome = RestoreOutcome::default();
        let mut restored: Vec<CatalogEntry> = Vec::new();

        {
            let engine = &*self;
            let per_file_key = if per_file { key } else { None };
            let outcome_ref = &mut outcome;
            let restored_ref = &mut restored;
            let sink = move |entry: &CatalogEntry, content: &mut dyn Read| -> Result<(), Error> {
                engine.control.check_cancelled()?;
                engine.control.wait_while_paused();
                match &per_file_key {
                    Some(key) => {
                        // wire entry carries the envelope; the catalog
                        // values describe the plaintext
                        let mut original = entry.clone();
                        original.file_path = entry
                            .file_path
                            .strip_suffix(crate::backup::ENCRYPTED_FILE_SUFFIX)
                            .unwrap_or(&entry.file_path)
                            .to_string();
                        original.file_size =
                            entry.file_size - crate::backup::ENVELOPE_OVERHEAD;
                        let mut decrypted =
                            crate::backup::CryptReader::new(content, key, entry.file_size)?;
                        engine.restore_file(
                            &original,
                            &mut decrypted,
                            request,
                            outcome_ref,
                            restored_ref,
                        )
                    }
                    None => engine.restore_file(entry, content, request, outcome_ref, restored_ref),
                }
            };

            if enveloped {
                let total_stream: u64 = plan.volumes.iter().map(|v| v.stream_bytes).sum();
                let decoded: Box<dyn Read> = match key {
                    Some(key) => Box::new(CryptReader::new(reader, &key, total_stream)?),
                    None => Box::new(reader),
                };
                let decompressed: Box<dyn Read> = match plan.compression {
                    Compression::None => decoded,
                    Compression::Gzip => Box::new(flate2::read::GzDecoder::new(decoded)),
                    Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(decoded)?),
                };
                let wanted: HashMap<String, CatalogEntry> = plan
                    .volumes
                    .iter()
                    .flat_map(|volume| volume.entries.iter())
                    .map(|entry| (entry.file_path.clone(), entry.clone()))
                    .collect();
                demux_sequential(decompressed, &wanted, sink)?;
            } else {
                // aligned: translate per-tape block offsets into
                // positions of the concatenated read stream
                let mut targets = Vec::new();
                let mut volume_base = 0u64;
                for volume in &plan.volumes {
                    for entry in &volume.entries {
                        let mut wire = entry.clone();
                        if per_file {
                            wire.file_path = format!(
                                "{}{}",
                                wire.file_path,
                                crate::backup::ENCRYPTED_FILE_SUFFIX
                            );
                            wire.file_size += crate::backup::ENVELOPE_OVERHEAD;
                        }
                        targets.push(AlignedTarget {
                            stream_pos: volume_base
                                + (entry.block_offset - volume.read_start_block)
                                    * block_size as u64,
                            entry: wire,
                        });
                    }
                    volume_base +=
                        (volume.end_block - volume.read_start_block) * block_size as u64;
                }
                targets.sort_by_key(|target| target.stream_pos);
                demux_aligned(reader, &targets, sink)?;
            }
        }

        if request.verify {
            self.phase(ExecutionPhase::Verifying);
            self.verify_restored(&restored, request, &mut outcome)?;
            outcome.verified = Some(outcome.file_errors.is_empty());
        }

        let (files, bytes) = self.tracker.counters();
        self.ctx
            .executions
            .update_counters(self.execution_id, files, bytes)?;

        self.tracker.log(format!(
            "restore finished: {} restored, {} skipped{}",
            outcome.files_restored,
            outcome.files_skipped,
            match outcome.verified {
                Some(true) => ", verified".to_string(),
                Some(false) => format!(", {} verification failures", outcome.file_errors.len()),
                None => String::new(),
            }
        ));
        self.phase(ExecutionPhase::Completed);

        Ok(outcome)
    }

    fn restore_file(
        &self,
        entry: &CatalogEntry,
        content: &mut dyn Read,
        request: &RestoreRequest,
        outcome: &mut RestoreOutcome,
        restored: &mut Vec<CatalogEntry>,
    ) -> Result<(), Error> {
        let rel = sanitize_rel_path(&entry.file_path)?;
        let dest = request.destination.join(rel);

        if dest.exists() && !request.overwrite {
            self.tracker
                .log(format!("skipping existing '{}'", entry.file_path));
            outcome.files_skipped += 1;
            // the stream still has to be drained by the demux caller
            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // write to a temp file, rename into place
        let file_name = dest
            .file_name()
            .ok_or_else(|| format_err!("invalid destination for '{}'", entry.file_path))?;
        let tmp = dest.with_file_name(format!(".{}.tmp-restore", file_name.to_string_lossy()));

        let mut written = 0u64;
        {
            let mut out = std::fs::File::create(&tmp)
                .with_context(|| format!("creating {:?}", tmp))?;
            let mut buffer = [0u8; 64 * 1024];
            loop {
                let n = content.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buffer[..n])?;
                written += n as u64;
                self.tracker.add_bytes(n as u64);
                if self.tracker.publish_due() {
                    self.ctx.events.publish(self.tracker.snapshot());
                }
            }
            out.flush()?;
        }

        if written != entry.file_size {
            let _ = std::fs::remove_file(&tmp);
            bail!(
                "short read for '{}': got {} of {} bytes",
                entry.file_path,
                written,
                entry.file_size
            );
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &tmp,
                std::fs::Permissions::from_mode(entry.file_mode & 0o7777),
            );
        }

        std::fs::rename(&tmp, &dest)
            .with_context(|| format!("renaming {:?} into place", tmp))?;

        outcome.files_restored += 1;
        outcome.bytes_restored += written;
        restored.push(entry.clone());
        self.tracker.file_done();
        Ok(())
    }

    /// Re-read restored files from disk and compare against the catalog.
    fn verify_restored(
        &self,
        restored: &[CatalogEntry],
        request: &RestoreRequest,
        outcome: &mut RestoreOutcome,
    ) -> Result<(), Error> {
        for entry in restored {
            self.control.check_cancelled()?;

            let dest = request.destination.join(sanitize_rel_path(&entry.file_path)?);
            let mut file = match std::fs::File::open(&dest) {
                Ok(file) => file,
                Err(err) => {
                    outcome
                        .file_errors
                        .push((entry.file_path.clone(), format!("unreadable: {}", err)));
                    continue;
                }
            };

            let mut hasher = openssl::sha::Sha256::new();
            let mut buffer = [0u8; 64 * 1024];
            let mut size = 0u64;
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
                size += n as u64;
            }

            if size != entry.file_size {
                outcome.file_errors.push((
                    entry.file_path.clone(),
                    format!("size mismatch ({} != {})", size, entry.file_size),
                ));
                continue;
            }
            let digest = hex::encode(hasher.finish());
            if !entry.checksum.is_empty() && digest != entry.checksum {
                outcome
                    .file_errors
                    .push((entry.file_path.clone(), "checksum mismatch".to_string()));
            }
        }
        Ok(())
    }
}

/// Volume source driving the operator protocol: when the wrong tape is
/// loaded a wrong-tape change request is opened and the run parks until
/// the acknowledgment arrives.
struct OperatorVolumeSource {
    ctx: Arc<ExecutionContext>,
    control: TaskControl,
    tracker: Arc<ProgressTracker>,
    execution_id: Id,
    drive: DriveConfig,
    block_size: usize,
}

impl OperatorVolumeSource {
    fn loaded_label(&self, session: &mut DeviceSession) -> Result<Option<(Uuid, String)>, Error> {
        match read_media_label(session)? {
            Some(label) => Ok(Some((label.uuid, label.label))),
            None => Ok(None),
        }
    }

    fn wrong_tape_pause(&self, spec: &VolumeSpec, found: &str) -> Result<(), Error> {
        let current_tape_id = self
            .ctx
            .registry
            .tape_by_label(found)
            .ok()
            .map(|tape| tape.id);
        let request = self.ctx.executions.open_change_request(
            self.execution_id,
            current_tape_id,
            ChangeReason::WrongTape,
        )?;
        self.ctx
            .executions
            .set_status(self.execution_id, ExecutionStatus::Paused)?;
        self.tracker.set_status(ExecutionStatus::Paused);
        self.tracker.set_phase(ExecutionPhase::Paused {
            reason: "wrong_tape".to_string(),
        });
        self.ctx.events.publish(self.tracker.snapshot());
        self.tracker.log(format!(
            "wrong tape: expected '{}', found '{}', waiting for operator",
            spec.tape_label, found
        ));

        loop {
            let ack = self.control.wait_tape_change()?;
            if ack.request_id == request.id {
                break;
            }
        }

        self.ctx
            .executions
            .set_change_request_status(request.id, ChangeRequestStatus::Completed)?;
        self.ctx
            .executions
            .set_status(self.execution_id, ExecutionStatus::Running)?;
        self.tracker.set_status(ExecutionStatus::Running);
        self.tracker.set_phase(ExecutionPhase::Streaming);
        self.ctx.events.publish(self.tracker.snapshot());
        Ok(())
    }
}

impl VolumeSource for OperatorVolumeSource {
    fn open_volume(&mut self, spec: &VolumeSpec) -> Result<DeviceSession, Error> {
        loop {
            self.control.check_cancelled()?;

            match open_session(&self.drive, &self.ctx.lock_dir(), self.block_size) {
                Ok(mut session) => match self.loaded_label(&mut session)? {
                    Some((uuid, _)) if uuid == spec.expected_uuid => {
                        self.tracker
                            .log(format!("reading from tape '{}'", spec.tape_label));
                        return Ok(session);
                    }
                    Some((_, label)) => {
                        drop(session);
                        self.wrong_tape_pause(spec, &label)?;
                    }
                    None => {
                        drop(session);
                        self.wrong_tape_pause(spec, "unlabeled media")?;
                    }
                },
                Err(err) => {
                    self.tracker
                        .log(format!("drive not ready for '{}': {}", spec.tape_label, err));
                    if !self.control.sleep(std::time::Duration::from_secs(1)) {
                        bail!("task cancelled");
                    }
                }
            }
        }
    }
}
