//! Linux `st` driver backend for LTO drives.

use std::fs::File;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;

use serde::{Deserialize, Serialize};

use crate::linux_mtio::*;
use crate::{BlockReadError, DeviceError, DriveStatus, TapeDensity, TapeDriver};

/// Configuration of a physical LTO drive.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LtoTapeDrive {
    pub name: String,
    /// Path to the non-rewinding device node (e.g. `/dev/nst0`).
    pub path: String,
}

/// Open handle to a Linux tape device.
///
/// The device is switched to fixed-block mode with the session block size,
/// so `MTSEEK`/`MTTELL` address logical blocks of that size.
pub struct LtoTapeHandle {
    file: File,
    path: String,
    block_size: usize,
}

impl LtoTapeDrive {
    /// Open the device node.
    ///
    /// Checks that the path is a character device, that a tape is loaded
    /// and switches the drive to fixed-block mode.
    pub fn open(&self, block_size: usize) -> Result<LtoTapeHandle, DeviceError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(DeviceError::from_io)?;

        let metadata = file.metadata().map_err(DeviceError::from_io)?;
        if !metadata.file_type().is_char_device() {
            return Err(DeviceError::MediaError(format!(
                "'{}' is not a tape device node",
                self.path
            )));
        }

        let mut handle = LtoTapeHandle {
            file,
            path: self.path.clone(),
            block_size,
        };

        let status = handle.status()?;
        if !status.ready {
            return Err(DeviceError::NoTape);
        }

        handle.set_block_size(block_size)?;

        Ok(handle)
    }
}

impl LtoTapeHandle {
    fn mtop(&mut self, op: MTCmd, count: i32, what: &str) -> Result<(), DeviceError> {
        let cmd = mtop {
            mt_op: op,
            mt_count: count,
        };
        unsafe { mtioctop(self.file.as_raw_fd(), &cmd) }
            .map(|_| ())
            .map_err(|err| DeviceError::PositioningFailed(format!("{} failed - {}", what, err)))
    }

    fn get_status(&mut self) -> Result<mtget, DeviceError> {
        let mut status = mtget::default();
        if let Err(err) = unsafe { mtiocget(self.file.as_raw_fd(), &mut status) } {
            return Err(DeviceError::MediaError(format!("MTIOCGET failed - {}", err)));
        }
        Ok(status)
    }

    /// Switch to fixed-block mode with the given block size.
    pub fn set_block_size(&mut self, size: usize) -> Result<(), DeviceError> {
        if size > i32::MAX as usize {
            return Err(DeviceError::MediaError("block size too large".to_string()));
        }
        self.mtop(MTCmd::MTSETBLK, size as i32, "MTSETBLK")?;
        self.block_size = size;
        Ok(())
    }
}

impl TapeDriver for LtoTapeHandle {
    fn device_path(&self) -> &str {
        &self.path
    }

    fn status(&mut self) -> Result<DriveStatus, DeviceError> {
        let status = self.get_status()?;

        let gstat = GMTStatusFlags::from_bits_truncate(status.mt_gstat);
        let density_code = ((status.mt_dsreg & MT_ST_DENSITY_MASK) >> MT_ST_DENSITY_SHIFT) as u8;

        Ok(DriveStatus {
            ready: gstat.contains(GMTStatusFlags::ONLINE)
                && !gstat.contains(GMTStatusFlags::DRIVE_OPEN),
            write_protect: gstat.contains(GMTStatusFlags::WR_PROT),
            density: if density_code != 0 {
                Some(TapeDensity::from(density_code))
            } else {
                None
            },
            block_number: if status.mt_blkno >= 0 {
                Some(status.mt_blkno as u64)
            } else {
                None
            },
        })
    }

    fn rewind(&mut self) -> Result<(), DeviceError> {
        self.mtop(MTCmd::MTREW, 1, "rewind")
    }

    fn seek_block(&mut self, block: u64) -> Result<(), DeviceError> {
        let count = i32::try_from(block)
            .map_err(|_| DeviceError::PositioningFailed("block number too large".to_string()))?;
        self.mtop(MTCmd::MTSEEK, count, "seek to block")
    }

    fn space_filemarks(&mut self, count: u32) -> Result<(), DeviceError> {
        let count = i32::try_from(count)
            .map_err(|_| DeviceError::PositioningFailed("filemark count too large".to_string()))?;
        self.mtop(MTCmd::MTFSF, count, "forward space filemarks")
    }

    fn write_filemark(&mut self) -> Result<(), DeviceError> {
        self.mtop(MTCmd::MTWEOF, 1, "write filemark")
            .map_err(|_| DeviceError::MediaError("writing filemark failed".to_string()))
    }

    fn move_to_eom(&mut self) -> Result<(), DeviceError> {
        self.mtop(MTCmd::MTEOM, 1, "move to end of media")
    }

    fn current_block(&mut self) -> Result<u64, DeviceError> {
        let mut pos = mtpos { mt_blkno: 0 };
        if unsafe { mtiocpos(self.file.as_raw_fd(), &mut pos) }.is_ok() && pos.mt_blkno >= 0 {
            return Ok(pos.mt_blkno as u64);
        }
        // MTIOCPOS is optional, fall back to the status register
        let status = self.get_status()?;
        if status.mt_blkno < 0 {
            return Err(DeviceError::PositioningFailed(
                "drive does not report a block number".to_string(),
            ));
        }
        Ok(status.mt_blkno as u64)
    }

    fn read_block(&mut self, buffer: &mut [u8]) -> Result<usize, BlockReadError> {
        if buffer.len() != self.block_size {
            return Err(BlockReadError::Device(DeviceError::MediaError(
                "read with wrong block size".to_string(),
            )));
        }
        loop {
            let ret = unsafe {
                libc::read(
                    self.file.as_raw_fd(),
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                // EIO at EOD is the drive telling us there is nothing left
                if let Ok(status) = self.get_status() {
                    let gstat = GMTStatusFlags::from_bits_truncate(status.mt_gstat);
                    if gstat.contains(GMTStatusFlags::EOD) {
                        return Err(BlockReadError::EndOfData);
                    }
                }
                return Err(BlockReadError::Device(DeviceError::from_io(err)));
            }
            if ret == 0 {
                // the st driver returns a zero-length read at a filemark
                return Err(BlockReadError::FileMark);
            }
            return Ok(ret as usize);
        }
    }

    fn write_block(&mut self, buffer: &[u8]) -> Result<bool, DeviceError> {
        if buffer.len() != self.block_size {
            return Err(DeviceError::MediaError(
                "write with wrong block size".to_string(),
            ));
        }
        loop {
            let ret = unsafe {
                libc::write(
                    self.file.as_raw_fd(),
                    buffer.as_ptr() as *const libc::c_void,
                    buffer.len(),
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(DeviceError::from_io(err));
            }
            if ret as usize != buffer.len() {
                return Err(DeviceError::EndOfTape);
            }
            // early warning shows up in the generic status once the drive
            // passes the LEOM point
            let status = self.get_status()?;
            let gstat = GMTStatusFlags::from_bits_truncate(status.mt_gstat);
            return Ok(gstat.contains(GMTStatusFlags::EOT));
        }
    }

    fn eject(&mut self) -> Result<(), DeviceError> {
        self.mtop(MTCmd::MTOFFL, 1, "eject")
            .map_err(|_| DeviceError::MediaError("eject failed".to_string()))
    }

    fn density(&mut self) -> Result<TapeDensity, DeviceError> {
        let status = self.get_status()?;
        let code = ((status.mt_dsreg & MT_ST_DENSITY_MASK) >> MT_ST_DENSITY_SHIFT) as u8;
        if code == 0 {
            return Err(DeviceError::NoTape);
        }
        Ok(TapeDensity::from(code))
    }
}
