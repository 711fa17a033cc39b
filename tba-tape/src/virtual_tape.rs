//! File-backed tape drive emulation.
//!
//! Used by tests and development setups. A tape is modelled as a sequence
//! of slots; each slot holds either one data block or a filemark. Slot `n`
//! of tape `x` lives at byte offset `n * block_size` of `tape-x.data`,
//! with a JSON sidecar recording filemark positions and the recorded
//! length. Writing at a position invalidates everything behind it, like a
//! real drive does.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{BlockReadError, DeviceError, DriveStatus, TapeDensity, TapeDriver};

/// Configuration of an emulated drive.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VirtualTapeDrive {
    pub name: String,
    /// Directory holding the tape files.
    pub path: String,
    /// Emulated capacity in bytes (default 64 MiB).
    pub max_size: Option<usize>,
}

#[derive(Serialize, Deserialize)]
struct TapeIndex {
    /// Number of recorded slots (data blocks + filemarks).
    slots: u64,
    /// Slot positions holding a filemark.
    filemarks: BTreeSet<u64>,
}

#[derive(Serialize, Deserialize)]
struct VirtualDriveStatus {
    current_tape: Option<String>,
}

pub struct VirtualTapeHandle {
    drive_name: String,
    path: PathBuf,
    tape_name: String,
    block_size: usize,
    max_slots: u64,
    pos: u64,
    index: TapeIndex,
    data: File,
}

impl VirtualTapeDrive {
    fn status_file(&self) -> PathBuf {
        PathBuf::from(&self.path).join("drive-status.json")
    }

    fn index_file(&self, tape: &str) -> PathBuf {
        PathBuf::from(&self.path).join(format!("tape-{}.json", tape))
    }

    fn data_file(&self, tape: &str) -> PathBuf {
        PathBuf::from(&self.path).join(format!("tape-{}.data", tape))
    }

    /// Load a tape into the emulated drive, creating it if necessary.
    pub fn load_media(&self, label: &str) -> Result<(), DeviceError> {
        std::fs::create_dir_all(&self.path).map_err(DeviceError::from_io)?;

        let index_path = self.index_file(label);
        if !index_path.exists() {
            let index = TapeIndex {
                slots: 0,
                filemarks: BTreeSet::new(),
            };
            let raw = serde_json::to_string_pretty(&index)
                .map_err(|err| DeviceError::MediaError(err.to_string()))?;
            std::fs::write(&index_path, raw).map_err(DeviceError::from_io)?;
        }

        let status = VirtualDriveStatus {
            current_tape: Some(label.to_string()),
        };
        let raw = serde_json::to_string_pretty(&status)
            .map_err(|err| DeviceError::MediaError(err.to_string()))?;
        std::fs::write(self.status_file(), raw).map_err(DeviceError::from_io)?;

        Ok(())
    }

    /// Unload the currently loaded tape.
    pub fn unload_media(&self) -> Result<(), DeviceError> {
        let status = VirtualDriveStatus { current_tape: None };
        let raw = serde_json::to_string_pretty(&status)
            .map_err(|err| DeviceError::MediaError(err.to_string()))?;
        std::fs::write(self.status_file(), raw).map_err(DeviceError::from_io)?;
        Ok(())
    }

    /// Label texts of all tapes present in the emulation directory.
    pub fn online_media_labels(&self) -> Result<Vec<String>, DeviceError> {
        let mut list = Vec::new();
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(list),
            Err(err) => return Err(DeviceError::from_io(err)),
        };
        for entry in entries {
            let entry = entry.map_err(DeviceError::from_io)?;
            let path = entry.path();
            if path.extension() != Some(std::ffi::OsStr::new("json")) {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|n| n.to_str()) {
                if let Some(label) = name.strip_prefix("tape-") {
                    list.push(label.to_string());
                }
            }
        }
        list.sort();
        Ok(list)
    }

    /// Open the drive. This fails if no tape is loaded.
    pub fn open(&self, block_size: usize) -> Result<VirtualTapeHandle, DeviceError> {
        let raw = std::fs::read(self.status_file()).map_err(|_| DeviceError::NoTape)?;
        let status: VirtualDriveStatus =
            serde_json::from_slice(&raw).map_err(|err| DeviceError::MediaError(err.to_string()))?;

        let tape_name = match status.current_tape {
            Some(name) => name,
            None => return Err(DeviceError::NoTape),
        };

        let raw = std::fs::read(self.index_file(&tape_name)).map_err(DeviceError::from_io)?;
        let index: TapeIndex =
            serde_json::from_slice(&raw).map_err(|err| DeviceError::MediaError(err.to_string()))?;

        let data = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(self.data_file(&tape_name))
            .map_err(DeviceError::from_io)?;

        let max_size = self.max_size.unwrap_or(64 * 1024 * 1024);
        let mut max_slots = (max_size / block_size) as u64;
        if max_slots < 4 {
            max_slots = 4;
        }

        Ok(VirtualTapeHandle {
            drive_name: self.name.clone(),
            path: PathBuf::from(&self.path),
            tape_name,
            block_size,
            max_slots,
            pos: 0,
            index,
            data,
        })
    }
}

impl VirtualTapeHandle {
    /// Logical end-of-media warning margin, in slots.
    const LEOM_MARGIN: u64 = 2;

    pub fn drive_name(&self) -> &str {
        &self.drive_name
    }

    fn store_index(&self) -> Result<(), DeviceError> {
        let path = self.path.join(format!("tape-{}.json", self.tape_name));
        let raw = serde_json::to_string_pretty(&self.index)
            .map_err(|err| DeviceError::MediaError(err.to_string()))?;
        std::fs::write(path, raw).map_err(DeviceError::from_io)?;
        Ok(())
    }

    // Writing at `pos` invalidates every slot at and behind it.
    fn truncate_at(&mut self, pos: u64) {
        self.index.filemarks = self.index.filemarks.iter().copied().filter(|&f| f < pos).collect();
        self.index.slots = pos;
    }
}

impl TapeDriver for VirtualTapeHandle {
    fn device_path(&self) -> &str {
        self.path.to_str().unwrap_or(".")
    }

    fn status(&mut self) -> Result<DriveStatus, DeviceError> {
        Ok(DriveStatus {
            ready: true,
            write_protect: false,
            density: Some(TapeDensity::Lto8),
            block_number: Some(self.pos),
        })
    }

    fn rewind(&mut self) -> Result<(), DeviceError> {
        self.pos = 0;
        Ok(())
    }

    fn seek_block(&mut self, block: u64) -> Result<(), DeviceError> {
        if block > self.index.slots {
            return Err(DeviceError::PositioningFailed(format!(
                "seek beyond recorded data (block {} > {})",
                block, self.index.slots
            )));
        }
        self.pos = block;
        Ok(())
    }

    fn space_filemarks(&mut self, count: u32) -> Result<(), DeviceError> {
        let mut remaining = count;
        while remaining > 0 {
            match self.index.filemarks.range(self.pos..).next().copied() {
                Some(mark) => {
                    self.pos = mark + 1;
                    remaining -= 1;
                }
                None => {
                    self.pos = self.index.slots;
                    return Err(DeviceError::PositioningFailed(
                        "space over filemark hit end of data".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn write_filemark(&mut self) -> Result<(), DeviceError> {
        if self.pos >= self.max_slots {
            return Err(DeviceError::EndOfTape);
        }
        self.truncate_at(self.pos);
        self.index.filemarks.insert(self.pos);
        self.pos += 1;
        self.index.slots = self.pos;
        self.store_index()
    }

    fn move_to_eom(&mut self) -> Result<(), DeviceError> {
        self.pos = self.index.slots;
        Ok(())
    }

    fn current_block(&mut self) -> Result<u64, DeviceError> {
        Ok(self.pos)
    }

    fn read_block(&mut self, buffer: &mut [u8]) -> Result<usize, BlockReadError> {
        if buffer.len() != self.block_size {
            return Err(BlockReadError::Device(DeviceError::MediaError(
                "read with wrong block size".to_string(),
            )));
        }
        if self.pos >= self.index.slots {
            return Err(BlockReadError::EndOfData);
        }
        if self.index.filemarks.contains(&self.pos) {
            // a zero-length read consumes the filemark
            self.pos += 1;
            return Err(BlockReadError::FileMark);
        }

        let offset = self.pos * self.block_size as u64;
        self.data
            .seek(SeekFrom::Start(offset))
            .map_err(|err| BlockReadError::Device(DeviceError::from_io(err)))?;
        self.data
            .read_exact(buffer)
            .map_err(|err| BlockReadError::Device(DeviceError::from_io(err)))?;

        self.pos += 1;
        Ok(self.block_size)
    }

    fn write_block(&mut self, buffer: &[u8]) -> Result<bool, DeviceError> {
        if buffer.len() != self.block_size {
            return Err(DeviceError::MediaError(
                "write with wrong block size".to_string(),
            ));
        }
        if self.pos >= self.max_slots {
            return Err(DeviceError::EndOfTape);
        }

        let offset = self.pos * self.block_size as u64;
        self.data
            .seek(SeekFrom::Start(offset))
            .map_err(DeviceError::from_io)?;
        self.data.write_all(buffer).map_err(DeviceError::from_io)?;

        self.truncate_at(self.pos);
        self.pos += 1;
        self.index.slots = self.pos;
        self.store_index()?;

        Ok(self.pos + Self::LEOM_MARGIN >= self.max_slots)
    }

    fn eject(&mut self) -> Result<(), DeviceError> {
        self.pos = 0;
        let status = VirtualDriveStatus { current_tape: None };
        let raw = serde_json::to_string_pretty(&status)
            .map_err(|err| DeviceError::MediaError(err.to_string()))?;
        std::fs::write(self.path.join("drive-status.json"), raw).map_err(DeviceError::from_io)?;
        Ok(())
    }

    fn density(&mut self) -> Result<TapeDensity, DeviceError> {
        Ok(TapeDensity::Lto8)
    }
}
