//! Device sessions: exclusive, serialized access to one tape drive.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use std::os::unix::io::AsRawFd;

use crate::{BlockReadError, DeviceError, DriveStatus, TapeDensity, TapeDriver};

/// Session lifecycle.
///
/// `Error` is terminal until the session is closed and reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Ready,
    Busy,
    Closing,
    Error,
}

/// Exclusive handle to one tape drive.
///
/// All I/O of a drive goes through its session, one operation at a time.
/// Cross-process exclusivity is enforced with a lock file derived from the
/// device path.
pub struct DeviceSession {
    driver: Box<dyn TapeDriver>,
    block_size: usize,
    state: SessionState,
    _lock: File,
}

fn lock_file_path(lock_dir: &Path, device_path: &str) -> PathBuf {
    let name: String = device_path
        .chars()
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    lock_dir.join(format!("{}.lck", name))
}

impl DeviceSession {
    /// Open a session over an already opened driver.
    ///
    /// Acquires the per-device lock file; a held lock means another
    /// process owns the drive and the open fails with `DeviceBusy`.
    pub fn open(
        driver: Box<dyn TapeDriver>,
        lock_dir: &Path,
        block_size: usize,
    ) -> Result<Self, DeviceError> {
        std::fs::create_dir_all(lock_dir).map_err(DeviceError::from_io)?;
        let lock_path = lock_file_path(lock_dir, driver.device_path());
        let lock = File::options()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(DeviceError::from_io)?;

        flock(lock.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|_| DeviceError::DeviceBusy)?;

        Ok(Self {
            driver,
            block_size,
            state: SessionState::Ready,
            _lock: lock,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device_path(&self) -> &str {
        self.driver.device_path()
    }

    fn op<T>(
        &mut self,
        f: impl FnOnce(&mut dyn TapeDriver) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        if self.state != SessionState::Ready {
            return Err(DeviceError::DeviceBusy);
        }
        self.state = SessionState::Busy;
        match f(self.driver.as_mut()) {
            Ok(value) => {
                self.state = SessionState::Ready;
                Ok(value)
            }
            // end of tape leaves the session usable at the completed
            // record boundary
            Err(DeviceError::EndOfTape) => {
                self.state = SessionState::Ready;
                Err(DeviceError::EndOfTape)
            }
            Err(err) => {
                self.state = SessionState::Error;
                Err(err)
            }
        }
    }

    pub fn status(&mut self) -> Result<DriveStatus, DeviceError> {
        self.op(|drv| drv.status())
    }

    pub fn rewind(&mut self) -> Result<(), DeviceError> {
        self.op(|drv| drv.rewind())
    }

    pub fn seek_block(&mut self, block: u64) -> Result<(), DeviceError> {
        self.op(|drv| drv.seek_block(block))
    }

    pub fn space_filemarks(&mut self, count: u32) -> Result<(), DeviceError> {
        self.op(|drv| drv.space_filemarks(count))
    }

    pub fn write_filemark(&mut self) -> Result<(), DeviceError> {
        self.op(|drv| drv.write_filemark())
    }

    /// Position at the end of recorded data, ready for appending.
    pub fn move_to_eom(&mut self) -> Result<(), DeviceError> {
        self.op(|drv| drv.move_to_eom())
    }

    /// Current logical block number.
    pub fn position(&mut self) -> Result<u64, DeviceError> {
        self.op(|drv| drv.current_block())
    }

    pub fn density(&mut self) -> Result<TapeDensity, DeviceError> {
        self.op(|drv| drv.density())
    }

    pub fn eject(&mut self) -> Result<(), DeviceError> {
        self.op(|drv| drv.eject())
    }

    /// Write one complete block. Returns true on logical end of media.
    pub fn write_block(&mut self, data: &[u8]) -> Result<bool, DeviceError> {
        self.op(|drv| drv.write_block(data))
    }

    /// Read the next block. Filemarks and end of data pass through
    /// without poisoning the session.
    pub fn read_block(&mut self, buffer: &mut [u8]) -> Result<usize, BlockReadError> {
        if self.state != SessionState::Ready {
            return Err(BlockReadError::Device(DeviceError::DeviceBusy));
        }
        self.state = SessionState::Busy;
        let result = self.driver.read_block(buffer);
        self.state = match &result {
            Err(BlockReadError::Device(_)) => SessionState::Error,
            _ => SessionState::Ready,
        };
        result
    }

    /// Close the session, releasing drive and lock.
    pub fn close(mut self) {
        self.state = SessionState::Closing;
        // lock file unlocks on drop
        self.state = SessionState::Closed;
    }

    /// Start writing a byte stream at the current position.
    ///
    /// The session stays `Busy` for the lifetime of the writer.
    pub fn write_stream(&mut self) -> Result<SessionWriter<'_>, DeviceError> {
        if self.state != SessionState::Ready {
            return Err(DeviceError::DeviceBusy);
        }
        let start_block = self.driver.current_block()?;
        self.state = SessionState::Busy;
        Ok(SessionWriter {
            session: self,
            start_block,
            buffer: Vec::new(),
            blocks_written: 0,
            leom: false,
            end_of_tape: false,
        })
    }

    /// Start reading a byte stream at the current position.
    ///
    /// Reading stops at the next filemark (or after `limit` bytes when
    /// given, which also strips the final block's padding).
    pub fn read_stream(&mut self, limit: Option<u64>) -> Result<SessionReader<'_>, DeviceError> {
        if self.state != SessionState::Ready {
            return Err(DeviceError::DeviceBusy);
        }
        self.state = SessionState::Busy;
        Ok(SessionReader {
            session: self,
            buffer: Vec::new(),
            buffer_pos: 0,
            remaining: limit,
            at_end: false,
        })
    }
}

/// Byte-stream writer over fixed-size blocks.
///
/// Bytes are buffered into blocks of the session block size; only complete
/// blocks are written to the drive. The final partial block is NUL-padded
/// by [`SessionWriter::finish`] or [`SessionWriter::flush_block`].
pub struct SessionWriter<'a> {
    session: &'a mut DeviceSession,
    start_block: u64,
    buffer: Vec<u8>,
    blocks_written: u64,
    leom: bool,
    end_of_tape: bool,
}

impl SessionWriter<'_> {
    /// Block the next written byte lands in.
    pub fn current_block(&self) -> u64 {
        self.start_block + self.blocks_written
    }

    /// Bytes buffered but not yet on tape.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes accepted into completed on-tape blocks.
    pub fn bytes_on_tape(&self) -> u64 {
        self.blocks_written * self.session.block_size as u64
    }

    /// True once the drive reported the logical end of media.
    pub fn logical_end_of_media(&self) -> bool {
        self.leom
    }

    /// True once a write hit the hard end of tape.
    pub fn end_of_tape(&self) -> bool {
        self.end_of_tape
    }

    /// Take the buffered tail that did not make it onto the tape.
    ///
    /// After end-of-tape the caller re-queues these bytes on the next
    /// volume to continue the stream byte-exactly.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn write_buffered_block(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.buffer.len(), self.session.block_size);
        match self.session.driver.write_block(&self.buffer) {
            Ok(leom) => {
                self.leom |= leom;
                self.buffer.clear();
                self.blocks_written += 1;
                Ok(())
            }
            Err(DeviceError::EndOfTape) => {
                self.end_of_tape = true;
                Err(DeviceError::EndOfTape.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Pad the current partial block with NUL and write it out.
    ///
    /// No-op when the stream sits exactly on a block boundary. Used to
    /// align every catalog entry to a seekable block.
    pub fn flush_block(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.resize(self.session.block_size, 0);
        self.write_buffered_block()
    }

    /// Flush the padded final block, optionally terminate with a
    /// filemark, and return the end block number.
    pub fn finish(mut self, write_filemark: bool) -> Result<u64, DeviceError> {
        if !self.buffer.is_empty() {
            self.buffer.resize(self.session.block_size, 0);
            self.write_buffered_block().map_err(|_| {
                if self.end_of_tape {
                    DeviceError::EndOfTape
                } else {
                    DeviceError::MediaError("flush of final block failed".to_string())
                }
            })?;
        }
        if write_filemark {
            self.session.driver.write_filemark()?;
        }
        let end = self.start_block + self.blocks_written;
        self.session.state = SessionState::Ready;
        Ok(end)
    }

    /// Release the session without flushing (after end-of-tape).
    pub fn abandon(self) -> u64 {
        let end = self.start_block + self.blocks_written;
        self.session.state = SessionState::Ready;
        end
    }
}

impl Drop for SessionWriter<'_> {
    fn drop(&mut self) {
        if self.session.state == SessionState::Busy {
            self.session.state = SessionState::Ready;
        }
    }
}

impl Write for SessionWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.end_of_tape {
            return Err(DeviceError::EndOfTape.into());
        }
        if data.is_empty() {
            return Ok(0);
        }
        let room = self.session.block_size - self.buffer.len();
        let take = room.min(data.len());
        self.buffer.extend_from_slice(&data[..take]);
        if self.buffer.len() == self.session.block_size {
            self.write_buffered_block()?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        // tapes flush when a filemark is written
        Ok(())
    }
}

/// Byte-stream reader over fixed-size blocks.
pub struct SessionReader<'a> {
    session: &'a mut DeviceSession,
    buffer: Vec<u8>,
    buffer_pos: usize,
    remaining: Option<u64>,
    at_end: bool,
}

impl SessionReader<'_> {
    /// Release the session.
    pub fn finish(self) {
        self.session.state = SessionState::Ready;
    }

    /// Read to the filemark, returning the number of bytes skipped.
    pub fn skip_to_end(&mut self) -> io::Result<u64> {
        let mut skipped = 0u64;
        let mut scratch = vec![0u8; self.session.block_size];
        loop {
            let n = self.read(&mut scratch)?;
            if n == 0 {
                return Ok(skipped);
            }
            skipped += n as u64;
        }
    }
}

impl Drop for SessionReader<'_> {
    fn drop(&mut self) {
        if self.session.state == SessionState::Busy {
            self.session.state = SessionState::Ready;
        }
    }
}

impl Read for SessionReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.at_end || out.is_empty() {
            return Ok(0);
        }
        if let Some(0) = self.remaining {
            self.at_end = true;
            return Ok(0);
        }

        if self.buffer_pos == self.buffer.len() {
            self.buffer.resize(self.session.block_size, 0);
            self.buffer_pos = 0;
            match self.session.driver.read_block(&mut self.buffer) {
                Ok(n) => self.buffer.truncate(n),
                Err(BlockReadError::FileMark) | Err(BlockReadError::EndOfData) => {
                    self.at_end = true;
                    self.buffer.clear();
                    return Ok(0);
                }
                Err(BlockReadError::Device(err)) => {
                    self.buffer.clear();
                    return Err(err.into());
                }
            }
        }

        let mut take = (self.buffer.len() - self.buffer_pos).min(out.len());
        if let Some(remaining) = self.remaining {
            take = take.min(remaining as usize);
        }
        out[..take].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + take]);
        self.buffer_pos += take;
        if let Some(remaining) = &mut self.remaining {
            *remaining -= take as u64;
        }
        Ok(take)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::VirtualTapeDrive;

    const BLOCK_SIZE: usize = 64 * 1024;

    fn test_session(name: &str, max_blocks: usize) -> DeviceSession {
        let mut dir: std::path::PathBuf = String::from("./target/testout").into();
        dir.push(module_path!());
        dir.push(name);
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::create_dir_all(&dir);

        let drive = VirtualTapeDrive {
            name: "drive0".to_string(),
            path: dir.to_str().unwrap().to_string(),
            max_size: Some(BLOCK_SIZE * max_blocks),
        };
        drive.load_media("t1").unwrap();
        let handle = drive.open(BLOCK_SIZE).unwrap();
        DeviceSession::open(Box::new(handle), &dir.join("locks"), BLOCK_SIZE).unwrap()
    }

    #[test]
    fn stream_roundtrip_with_padding() {
        let mut session = test_session("stream_roundtrip_with_padding", 16);

        let payload = b"hello tape".repeat(10_000); // > 1 block
        let mut writer = session.write_stream().unwrap();
        writer.write_all(&payload).unwrap();
        let end_block = writer.finish(true).unwrap();
        assert_eq!(end_block, 2); // 100k bytes => 2 blocks (padded)

        session.rewind().unwrap();
        let mut reader = session.read_stream(Some(payload.len() as u64)).unwrap();
        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn unlimited_read_stops_at_filemark() {
        let mut session = test_session("unlimited_read_stops_at_filemark", 16);

        let mut writer = session.write_stream().unwrap();
        writer.write_all(&[7u8; 100]).unwrap();
        writer.finish(true).unwrap();

        session.rewind().unwrap();
        let mut reader = session.read_stream(None).unwrap();
        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        // padded to a whole block, data up to the filemark
        assert_eq!(got.len(), BLOCK_SIZE);
        assert_eq!(&got[..100], &[7u8; 100]);
    }

    #[test]
    fn end_of_tape_keeps_pending_tail() {
        let mut session = test_session("end_of_tape_keeps_pending_tail", 4);

        let mut writer = session.write_stream().unwrap();
        let chunk = vec![3u8; BLOCK_SIZE / 2];
        let mut total_written = 0usize;
        loop {
            match writer.write_all(&chunk) {
                Ok(()) => total_written += chunk.len(),
                Err(_) => break,
            }
            if writer.end_of_tape() {
                break;
            }
        }
        assert!(writer.end_of_tape());
        let on_tape = writer.bytes_on_tape();
        let pending = writer.take_pending();
        // nothing lost: what was accepted is either on tape or pending
        assert!(on_tape + pending.len() as u64 >= total_written as u64);

        let end = writer.abandon();
        assert_eq!(end, session.position().unwrap());
    }

    #[test]
    fn flush_block_aligns_stream() {
        let mut session = test_session("flush_block_aligns_stream", 16);

        let mut writer = session.write_stream().unwrap();
        writer.write_all(&[1u8; 10]).unwrap();
        writer.flush_block().unwrap();
        assert_eq!(writer.current_block(), 1);
        writer.write_all(&[2u8; 10]).unwrap();
        writer.finish(true).unwrap();

        // second record starts exactly at block 1
        session.seek_block(1).unwrap();
        let mut reader = session.read_stream(Some(10)).unwrap();
        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, vec![2u8; 10]);
    }

    #[test]
    fn second_session_on_same_device_is_refused() {
        let mut dir: std::path::PathBuf = String::from("./target/testout").into();
        dir.push(module_path!());
        dir.push("second_session_refused");
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::create_dir_all(&dir);

        let drive = VirtualTapeDrive {
            name: "drive0".to_string(),
            path: dir.to_str().unwrap().to_string(),
            max_size: Some(BLOCK_SIZE * 8),
        };
        drive.load_media("t1").unwrap();

        let first = DeviceSession::open(
            Box::new(drive.open(BLOCK_SIZE).unwrap()),
            &dir.join("locks"),
            BLOCK_SIZE,
        )
        .unwrap();

        let second = DeviceSession::open(
            Box::new(drive.open(BLOCK_SIZE).unwrap()),
            &dir.join("locks"),
            BLOCK_SIZE,
        );
        assert!(matches!(second, Err(DeviceError::DeviceBusy)));

        drop(first);
    }
}
