//! Daemon configuration.
//!
//! Loading happens once at startup from a JSON file; there is no reload
//! machinery here. Invalid settings surface as a `Config` error and exit
//! code 1 in the binary.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use tba_tape::{MAX_TAPE_BLOCK_SIZE, MIN_TAPE_BLOCK_SIZE};

/// Tape tuning options (`tape.*`).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TapeTuning {
    /// Device used when a job does not name one.
    pub default_device: Option<String>,
    /// Fixed tape block size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Stream buffer size in MiB.
    #[serde(default = "default_buffer_size_mb")]
    pub buffer_size_mb: usize,
    /// Retries for transient media errors during a file write.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    /// Read back and compare checksums after streaming.
    #[serde(default)]
    pub verify_after_write: bool,
}

fn default_block_size() -> usize {
    tba_tape::DEFAULT_TAPE_BLOCK_SIZE
}

fn default_buffer_size_mb() -> usize {
    8
}

fn default_write_retries() -> u32 {
    3
}

impl Default for TapeTuning {
    fn default() -> Self {
        Self {
            default_device: None,
            block_size: default_block_size(),
            buffer_size_mb: default_buffer_size_mb(),
            write_retries: default_write_retries(),
            verify_after_write: false,
        }
    }
}

/// Kind of drive behind a device path.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriveKind {
    /// Linux `st` device node.
    Lto,
    /// File-backed emulation (tests, development).
    Virtual {
        #[serde(default)]
        max_size: Option<usize>,
    },
}

/// One configured drive.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DriveConfig {
    pub device_path: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: DriveKind,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TapeBackupConfig {
    #[serde(default)]
    pub tape: TapeTuning,
    #[serde(default)]
    pub drives: Vec<DriveConfig>,
    /// Database file path.
    pub database: PathBuf,
    /// Directory for device locks and other runtime state.
    pub state_dir: PathBuf,
}

impl TapeBackupConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read(path)
            .with_context(|| format!("unable to read config file {:?}", path))?;
        let config: TapeBackupConfig = serde_json::from_slice(&raw)
            .map_err(|err| format_err!("unable to parse config file {:?} - {}", path, err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.tape.block_size < MIN_TAPE_BLOCK_SIZE || self.tape.block_size > MAX_TAPE_BLOCK_SIZE
        {
            bail!(
                "tape.block_size {} out of range ({}..={})",
                self.tape.block_size,
                MIN_TAPE_BLOCK_SIZE,
                MAX_TAPE_BLOCK_SIZE
            );
        }
        if !self.tape.block_size.is_power_of_two() {
            bail!("tape.block_size must be a power of two");
        }
        if self.tape.write_retries == 0 {
            bail!("tape.write_retries must be at least 1");
        }
        for drive in &self.drives {
            if drive.device_path.is_empty() {
                bail!("drive '{}' has an empty device path", drive.display_name);
            }
        }
        if let Some(default) = &self.tape.default_device {
            if !self.drives.iter().any(|d| &d.device_path == default) {
                bail!("tape.default_device '{}' is not a configured drive", default);
            }
        }
        Ok(())
    }

    pub fn drive(&self, device_path: &str) -> Result<&DriveConfig, Error> {
        self.drives
            .iter()
            .find(|d| d.device_path == device_path)
            .ok_or_else(|| format_err!("no such drive '{}'", device_path))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal() -> TapeBackupConfig {
        TapeBackupConfig {
            tape: TapeTuning::default(),
            drives: vec![DriveConfig {
                device_path: "/dev/nst0".to_string(),
                display_name: "drive 0".to_string(),
                enabled: true,
                kind: DriveKind::Lto,
            }],
            database: PathBuf::from("/var/lib/tapebackarr/catalog.db"),
            state_dir: PathBuf::from("/run/tapebackarr"),
        }
    }

    #[test]
    fn default_tuning_is_valid() {
        minimal().validate().unwrap();
    }

    #[test]
    fn block_size_bounds_are_enforced() {
        let mut config = minimal();
        config.tape.block_size = 4096;
        assert!(config.validate().is_err());

        config.tape.block_size = 3 * 64 * 1024; // not a power of two
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_default_device_is_refused() {
        let mut config = minimal();
        config.tape.default_device = Some("/dev/nst9".to_string());
        assert!(config.validate().is_err());
    }
}
