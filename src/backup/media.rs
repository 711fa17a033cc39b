//! Spanning-aware media writer.
//!
//! [`MediaWriter`] sits at the bottom of the backup pipeline. It buffers
//! the byte stream into fixed-size blocks, retries transient block
//! writes with exponential backoff, and on end-of-tape (or a persistent
//! media error) asks its [`VolumeProvider`] for the next volume and
//! continues the stream byte-exactly on the new tape. The layers above
//! (tar, compression, encryption) never notice a volume switch, which is
//! what makes the concatenation of member streams equal the
//! single-volume stream.
//!
//! The writer is a cloneable handle so the engine can query positions
//! and force block alignment while the tar stack owns another clone.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Error;
use log::warn;

use tba_api_types::{ChangeReason, Id};
use tba_tape::{DeviceError, DeviceSession};

use crate::server::TaskControl;

/// Accounting of one volume (one tape) of a set stream.
#[derive(Clone, Debug)]
pub struct VolumeUsage {
    pub tape_id: Id,
    pub tape_label: String,
    /// First block of the stream on this tape.
    pub start_block: u64,
    /// Block behind the last written block.
    pub end_block: u64,
    /// Logical stream bytes on this volume (no padding).
    pub stream_bytes: u64,
    /// Physical bytes written (whole blocks).
    pub device_bytes: u64,
    /// Write-order index of the first file (fully or partially) on this
    /// volume.
    pub files_start_index: u64,
    /// One past the write-order index of the last file touching this
    /// volume.
    pub files_end_index: u64,
}

/// The next tape for a continued stream.
pub struct NextVolume {
    pub session: DeviceSession,
    pub tape_id: Id,
    pub tape_label: String,
    /// Data-region start on the new tape.
    pub start_block: u64,
}

/// Supplies fresh volumes when a tape fills or persistently fails.
///
/// Implementations open the tape change request, park the execution and
/// block until an operator acknowledges with a new tape (or the run is
/// cancelled).
pub trait VolumeProvider: Send {
    fn next_volume(
        &mut self,
        reason: ChangeReason,
        finished: &VolumeUsage,
    ) -> Result<NextVolume, Error>;

    /// Called once when the stream finishes, with the final volume's
    /// usage.
    fn volume_finished(&mut self, last: &VolumeUsage) -> Result<(), Error>;
}

struct MediaWriterInner {
    session: Option<DeviceSession>,
    block_size: usize,
    buffer: Vec<u8>,
    blocks_written: u64,
    current: VolumeUsage,
    finished_volumes: Vec<VolumeUsage>,
    provider: Box<dyn VolumeProvider>,
    control: TaskControl,
    write_retries: u32,
    leom: bool,
    /// Write-order index of the file currently streaming.
    note_index: u64,
}

/// Result of a finished set stream.
pub struct FinishedStream {
    pub session: DeviceSession,
    /// Usage per volume, in write order. One element for plain sets.
    pub volumes: Vec<VolumeUsage>,
    /// Block behind the final block of the stream.
    pub end_block: u64,
    /// Logical stream length over all volumes.
    pub stream_bytes: u64,
    /// The final volume reported the logical end of media.
    pub leom: bool,
}

#[derive(Clone)]
pub struct MediaWriter {
    inner: Arc<Mutex<MediaWriterInner>>,
}

fn provider_io_err(err: Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{:#}", err))
}

impl MediaWriterInner {
    fn current_stream_bytes(&self) -> u64 {
        self.current.stream_bytes + self.buffer.len() as u64
    }

    fn close_current(&mut self) -> VolumeUsage {
        let mut usage = self.current.clone();
        usage.end_block = usage.start_block + self.blocks_written;
        usage.device_bytes = self.blocks_written * self.block_size as u64;
        usage.files_end_index = self.note_index + 1;
        usage
    }

    fn switch_volume(&mut self, reason: ChangeReason, file_index: u64) -> io::Result<()> {
        let finished = self.close_current();
        warn!(
            "tape '{}' out of space or failing, requesting change ({:?})",
            finished.tape_label, reason
        );

        // the provider owns the operator interaction; the session of the
        // exhausted volume goes out of scope here, releasing the drive
        self.session = None;

        let next = self
            .provider
            .next_volume(reason, &finished)
            .map_err(provider_io_err)?;

        self.finished_volumes.push(finished);
        self.blocks_written = 0;
        self.current = VolumeUsage {
            tape_id: next.tape_id,
            tape_label: next.tape_label,
            start_block: next.start_block,
            end_block: next.start_block,
            stream_bytes: 0,
            device_bytes: 0,
            files_start_index: file_index,
            files_end_index: file_index,
        };
        self.session = Some(next.session);
        Ok(())
    }

    /// Write the buffered block, retrying transient errors and switching
    /// volumes on end-of-tape or persistent failure.
    fn write_buffered_block(&mut self, file_index: u64) -> io::Result<()> {
        debug_assert_eq!(self.buffer.len(), self.block_size);

        let mut attempt: u32 = 0;
        loop {
            if self.control.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "task cancelled"));
            }

            let session = self
                .session
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no volume loaded"))?;

            match session.write_block(&self.buffer) {
                Ok(leom) => {
                    self.leom |= leom;
                    self.blocks_written += 1;
                    self.current.stream_bytes += self.buffer.len() as u64;
                    self.buffer.clear();
                    return Ok(());
                }
                Err(DeviceError::EndOfTape) => {
                    self.switch_volume(ChangeReason::TapeFull, file_index)?;
                    attempt = 0;
                }
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt <= self.write_retries {
                        // 1 s, 2 s, 4 s, ...
                        let backoff = Duration::from_secs(1 << (attempt - 1).min(4));
                        warn!(
                            "block write failed ({}), retry {}/{} in {:?}",
                            err, attempt, self.write_retries, backoff
                        );
                        if !self.control.sleep(backoff) {
                            return Err(io::Error::new(
                                io::ErrorKind::Interrupted,
                                "task cancelled",
                            ));
                        }
                    } else {
                        self.switch_volume(ChangeReason::TapeError, file_index)?;
                        attempt = 0;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl MediaWriter {
    /// Start a stream at the current position of `session`.
    pub fn new(
        mut session: DeviceSession,
        tape_id: Id,
        tape_label: &str,
        provider: Box<dyn VolumeProvider>,
        control: TaskControl,
        write_retries: u32,
    ) -> Result<Self, Error> {
        let block_size = session.block_size();
        let start_block = session.position()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(MediaWriterInner {
                session: Some(session),
                block_size,
                buffer: Vec::with_capacity(block_size),
                blocks_written: 0,
                current: VolumeUsage {
                    tape_id,
                    tape_label: tape_label.to_string(),
                    start_block,
                    end_block: start_block,
                    stream_bytes: 0,
                    device_bytes: 0,
                    files_start_index: 0,
                    files_end_index: 0,
                },
                finished_volumes: Vec::new(),
                provider,
                control,
                write_retries,
                leom: false,
                note_index: 0,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MediaWriterInner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Record the write-order index of the file about to be streamed, so
    /// a mid-file volume switch attributes the file to the new volume.
    pub fn note_file_index(&self, index: u64) {
        self.lock().note_index = index;
    }

    /// Block the next written byte lands in (absolute, current volume).
    pub fn current_block(&self) -> u64 {
        let inner = self.lock();
        inner.current.start_block + inner.blocks_written
    }

    /// Tape currently being written.
    pub fn current_tape(&self) -> (Id, String) {
        let inner = self.lock();
        (inner.current.tape_id, inner.current.tape_label.clone())
    }

    /// Logical stream bytes accepted so far (all volumes).
    pub fn stream_bytes(&self) -> u64 {
        let inner = self.lock();
        inner
            .finished_volumes
            .iter()
            .map(|v| v.stream_bytes)
            .sum::<u64>()
            + inner.current_stream_bytes()
    }

    /// True once any volume reported the logical end of media.
    pub fn logical_end_of_media(&self) -> bool {
        self.lock().leom
    }

    /// Number of volumes used so far.
    pub fn volume_count(&self) -> usize {
        let inner = self.lock();
        inner.finished_volumes.len() + 1
    }

    /// Pad the partial block with NUL and write it, aligning the next
    /// byte to a block boundary. Used by the plain pipeline to make
    /// every catalog entry seekable.
    pub fn flush_block(&self) -> io::Result<()> {
        let mut inner = self.lock();
        if inner.buffer.is_empty() {
            return Ok(());
        }
        // padding is device layout, not stream content
        let pad = inner.block_size - inner.buffer.len();
        let block_size = inner.block_size;
        inner.buffer.resize(block_size, 0);
        let index = inner.note_index;
        inner.write_buffered_block(index)?;
        inner.current.stream_bytes -= pad as u64;
        Ok(())
    }

    /// Flush the final padded block, write the terminating filemark and
    /// return the last session plus per-volume accounting.
    ///
    /// Other handles (the dismantled pipeline stack) become unusable
    /// afterwards.
    pub fn finish(self) -> Result<FinishedStream, Error> {
        let mut inner = self.lock();

        if !inner.buffer.is_empty() {
            let pad = inner.block_size - inner.buffer.len();
            let block_size = inner.block_size;
            inner.buffer.resize(block_size, 0);
            let index = inner.note_index;
            inner.write_buffered_block(index)?;
            inner.current.stream_bytes -= pad as u64;
        }

        let last = inner.close_current();
        inner.provider.volume_finished(&last)?;

        let mut session = inner
            .session
            .take()
            .ok_or_else(|| anyhow::format_err!("media writer lost its session"))?;
        session.write_filemark()?;

        let mut volumes = std::mem::take(&mut inner.finished_volumes);
        volumes.push(last.clone());

        Ok(FinishedStream {
            session,
            end_block: last.end_block,
            stream_bytes: volumes.iter().map(|v| v.stream_bytes).sum(),
            leom: inner.leom,
            volumes,
        })
    }
}

impl Write for MediaWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        if data.is_empty() {
            return Ok(0);
        }
        let room = inner.block_size - inner.buffer.len();
        let take = room.min(data.len());
        inner.buffer.extend_from_slice(&data[..take]);
        if inner.buffer.len() == inner.block_size {
            let index = inner.note_index;
            inner.write_buffered_block(index)?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
