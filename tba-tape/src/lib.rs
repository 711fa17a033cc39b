//! Tape device access.
//!
//! The [`TapeDriver`] trait abstracts a block-addressed tape drive. Two
//! implementations exist: [`LtoTapeHandle`] for Linux `st` character
//! devices, and [`VirtualTapeHandle`], a file-backed emulation used by
//! tests and development setups.
//!
//! [`DeviceSession`] wraps a driver with exclusive-access enforcement, the
//! session state machine and byte-stream adapters over fixed-size blocks.

mod linux_mtio;

mod lto_tape;
pub use lto_tape::*;

mod virtual_tape;
pub use virtual_tape::*;

mod session;
pub use session::*;

use thiserror::Error;

/// Default tape block size (bytes). Overridable via `tape.block_size`.
pub const DEFAULT_TAPE_BLOCK_SIZE: usize = 256 * 1024;

/// Smallest accepted block size (64 KiB).
pub const MIN_TAPE_BLOCK_SIZE: usize = 64 * 1024;

/// Largest accepted block size (1 MiB).
pub const MAX_TAPE_BLOCK_SIZE: usize = 1024 * 1024;

/// Errors surfaced by tape drives and sessions.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no tape loaded")]
    NoTape,
    #[error("tape is write protected")]
    WriteProtect,
    #[error("end of tape reached")]
    EndOfTape,
    #[error("media error: {0}")]
    MediaError(String),
    #[error("positioning failed: {0}")]
    PositioningFailed(String),
    #[error("device is busy")]
    DeviceBusy,
}

impl DeviceError {
    /// Map an OS error from a tape read/write to the device taxonomy.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOSPC) => DeviceError::EndOfTape,
            Some(libc::ENOMEDIUM) => DeviceError::NoTape,
            Some(libc::EACCES) | Some(libc::EROFS) => DeviceError::WriteProtect,
            Some(libc::EBUSY) => DeviceError::DeviceBusy,
            _ => DeviceError::MediaError(err.to_string()),
        }
    }

    /// True for errors a write may retry (transient media problems).
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::MediaError(_))
    }
}

impl From<DeviceError> for std::io::Error {
    fn from(err: DeviceError) -> Self {
        let kind = match err {
            DeviceError::EndOfTape => std::io::ErrorKind::WriteZero,
            DeviceError::DeviceBusy => std::io::ErrorKind::WouldBlock,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err.to_string())
    }
}

/// Result of reading one block.
#[derive(Error, Debug)]
pub enum BlockReadError {
    #[error(transparent)]
    Device(DeviceError),
    /// Hit a filemark (end of the current data region).
    #[error("filemark")]
    FileMark,
    /// No more recorded data on the tape.
    #[error("end of recorded data")]
    EndOfData,
}

/// Tape density code as reported by the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeDensity {
    Lto6,
    Lto7,
    Lto8,
    Lto9,
    Unknown(u8),
}

impl From<u8> for TapeDensity {
    fn from(code: u8) -> Self {
        match code {
            0x5a => TapeDensity::Lto6,
            0x5c => TapeDensity::Lto7,
            0x5e => TapeDensity::Lto8,
            0x60 => TapeDensity::Lto9,
            other => TapeDensity::Unknown(other),
        }
    }
}

/// Drive status snapshot.
#[derive(Debug, Clone)]
pub struct DriveStatus {
    /// Tape loaded and ready.
    pub ready: bool,
    /// Write protect tab set on the loaded tape.
    pub write_protect: bool,
    /// Density of the loaded media, if known.
    pub density: Option<TapeDensity>,
    /// Current block number, if the drive reports one.
    pub block_number: Option<u64>,
}

/// Block-addressed access to one tape drive.
///
/// All operations are blocking. Positioning is absolute by block number or
/// relative by filemark count. `write_block` returns `Ok(true)` once the
/// drive signals the logical end of media (early warning); the hard end of
/// tape surfaces as [`DeviceError::EndOfTape`] and never destroys
/// previously written blocks.
pub trait TapeDriver: Send {
    /// Path of the underlying device (or emulation directory).
    fn device_path(&self) -> &str;

    fn status(&mut self) -> Result<DriveStatus, DeviceError>;

    fn rewind(&mut self) -> Result<(), DeviceError>;

    /// Absolute seek to a block number.
    fn seek_block(&mut self, block: u64) -> Result<(), DeviceError>;

    /// Forward-space over `count` filemarks, positioning at the first
    /// record of the following file.
    fn space_filemarks(&mut self, count: u32) -> Result<(), DeviceError>;

    fn write_filemark(&mut self) -> Result<(), DeviceError>;

    /// Position at the end of recorded data, ready for appending.
    fn move_to_eom(&mut self) -> Result<(), DeviceError>;

    /// Current block number.
    fn current_block(&mut self) -> Result<u64, DeviceError>;

    /// Read the next block into `buffer`, returning the payload length.
    fn read_block(&mut self, buffer: &mut [u8]) -> Result<usize, BlockReadError>;

    /// Write one complete block. Returns true on logical end of media.
    fn write_block(&mut self, buffer: &[u8]) -> Result<bool, DeviceError>;

    /// Rewind and eject the media.
    fn eject(&mut self) -> Result<(), DeviceError>;

    fn density(&mut self) -> Result<TapeDensity, DeviceError>;
}
