//! Opening drives from configuration.

use std::path::Path;

use anyhow::{format_err, Error};

use crate::config::{DriveConfig, DriveKind};
use tba_tape::{DeviceSession, LtoTapeDrive, TapeDriver, VirtualTapeDrive};

/// Open the configured drive (fails if no tape is loaded).
pub fn open_drive(
    config: &DriveConfig,
    block_size: usize,
) -> Result<Box<dyn TapeDriver>, Error> {
    if !config.enabled {
        return Err(format_err!("drive '{}' is disabled", config.display_name));
    }
    let driver: Box<dyn TapeDriver> = match &config.kind {
        DriveKind::Lto => {
            let drive = LtoTapeDrive {
                name: config.display_name.clone(),
                path: config.device_path.clone(),
            };
            Box::new(drive.open(block_size)?)
        }
        DriveKind::Virtual { max_size } => {
            let drive = VirtualTapeDrive {
                name: config.display_name.clone(),
                path: config.device_path.clone(),
                max_size: *max_size,
            };
            Box::new(drive.open(block_size)?)
        }
    };
    Ok(driver)
}

/// Open a device session on the configured drive.
pub fn open_session(
    config: &DriveConfig,
    lock_dir: &Path,
    block_size: usize,
) -> Result<DeviceSession, Error> {
    let driver = open_drive(config, block_size)?;
    Ok(DeviceSession::open(driver, lock_dir, block_size)?)
}

/// Emulated-drive view of a configured virtual drive.
///
/// Used by tests and by operator tooling to load media into the
/// emulation; real drives get their media loaded by hands or robots.
pub fn virtual_drive(config: &DriveConfig) -> Result<VirtualTapeDrive, Error> {
    match &config.kind {
        DriveKind::Virtual { max_size } => Ok(VirtualTapeDrive {
            name: config.display_name.clone(),
            path: config.device_path.clone(),
            max_size: *max_size,
        }),
        DriveKind::Lto => Err(format_err!(
            "drive '{}' is not a virtual drive",
            config.display_name
        )),
    }
}
