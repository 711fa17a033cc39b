//! On-tape file formats.
//!
//! The only structured on-tape artifact besides the per-set tar streams is
//! the media label: one UTF-8 JSON object, NUL-padded to a single tape
//! block, written as the first file of every labeled tape and terminated
//! by a filemark. The backup data region starts behind that filemark.

use std::io::{Read, Write};

use anyhow::{bail, format_err, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tba_api_types::TapeFormat;
use tba_tape::{DeviceSession, SessionState};

/// Magic value of the label header.
pub const MEDIA_LABEL_MAGIC: &str = "TAPEBACKARR_v1";

/// Current label version.
pub const MEDIA_LABEL_VERSION: u32 = 1;

/// Media label, block 0 of every labeled tape.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MediaLabel {
    pub magic: String,
    pub version: u32,
    /// Label text (or barcode).
    pub label: String,
    pub uuid: Uuid,
    /// Pool the tape was labeled for.
    pub pool: String,
    pub format: TapeFormat,
    pub created_at: DateTime<Utc>,
}

impl MediaLabel {
    pub fn new(label: &str, uuid: Uuid, pool: &str, format: TapeFormat) -> Self {
        Self {
            magic: MEDIA_LABEL_MAGIC.to_string(),
            version: MEDIA_LABEL_VERSION,
            label: label.to_string(),
            uuid,
            pool: pool.to_string(),
            format,
            created_at: Utc::now(),
        }
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.magic != MEDIA_LABEL_MAGIC {
            bail!("media label has wrong magic '{}'", self.magic);
        }
        if self.version != MEDIA_LABEL_VERSION {
            bail!("unsupported media label version {}", self.version);
        }
        Ok(())
    }
}

/// Write `label` to the beginning of the tape.
///
/// This rewinds and overwrites: everything previously on the tape becomes
/// unreadable. The caller is responsible for the relabel-needs-force rule.
pub fn write_media_label(session: &mut DeviceSession, label: &MediaLabel) -> Result<(), Error> {
    let raw = serde_json::to_vec(label)?;
    if raw.len() >= session.block_size() {
        bail!("media label too large for one tape block");
    }

    session.rewind()?;
    let mut writer = session.write_stream()?;
    writer.write_all(&raw)?;
    // finish pads the block with NUL and terminates the label file
    writer.finish(true)?;

    Ok(())
}

/// Read the media label.
///
/// Returns `None` for a blank (unlabeled) tape. After a successful read
/// the session is positioned at the start of the data region.
pub fn read_media_label(session: &mut DeviceSession) -> Result<Option<MediaLabel>, Error> {
    session.rewind()?;

    let block_size = session.block_size();
    let mut reader = session.read_stream(None)?;
    let mut block = Vec::with_capacity(block_size);
    reader.by_ref().take(block_size as u64).read_to_end(&mut block)?;
    // consume through the filemark so the session sits at the data
    // region afterwards
    reader.skip_to_end()?;
    drop(reader);

    if session.state() == SessionState::Error {
        bail!("tape read failed while looking for a label");
    }
    if block.is_empty() {
        return Ok(None); // blank tape
    }

    let json_len = block.iter().position(|&b| b == 0).unwrap_or(block.len());
    let label: MediaLabel = serde_json::from_slice(&block[..json_len])
        .map_err(|err| format_err!("unable to parse media label - {}", err))?;
    label.check()?;

    Ok(Some(label))
}

/// Position the session at the first block of the data region.
pub fn seek_to_data_start(session: &mut DeviceSession) -> Result<u64, Error> {
    session.rewind()?;
    session.space_filemarks(1)?;
    Ok(session.position()?)
}

#[cfg(test)]
mod test {
    use super::*;
    use tba_tape::{DeviceSession, VirtualTapeDrive};

    const BLOCK_SIZE: usize = 64 * 1024;

    fn test_session(name: &str) -> DeviceSession {
        let mut dir: std::path::PathBuf = String::from("./target/testout").into();
        dir.push(module_path!());
        dir.push(name);
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::create_dir_all(&dir);

        let drive = VirtualTapeDrive {
            name: "drive0".to_string(),
            path: dir.to_str().unwrap().to_string(),
            max_size: Some(BLOCK_SIZE * 32),
        };
        drive.load_media("t1").unwrap();
        DeviceSession::open(
            Box::new(drive.open(BLOCK_SIZE).unwrap()),
            &dir.join("locks"),
            BLOCK_SIZE,
        )
        .unwrap()
    }

    #[test]
    fn label_roundtrip() {
        let mut session = test_session("label_roundtrip");

        assert!(read_media_label(&mut session).unwrap().is_none());

        let uuid = Uuid::new_v4();
        let label = MediaLabel::new("LBL001", uuid, "pool1", TapeFormat::Raw);
        write_media_label(&mut session, &label).unwrap();

        let read = read_media_label(&mut session).unwrap().unwrap();
        assert_eq!(read.label, "LBL001");
        assert_eq!(read.uuid, uuid);
        assert_eq!(read.pool, "pool1");
        assert_eq!(read.magic, MEDIA_LABEL_MAGIC);
    }

    #[test]
    fn data_region_starts_behind_label() {
        let mut session = test_session("data_region_starts_behind_label");

        let label = MediaLabel::new("LBL002", Uuid::new_v4(), "pool1", TapeFormat::Raw);
        write_media_label(&mut session, &label).unwrap();

        let start = seek_to_data_start(&mut session).unwrap();
        assert!(start >= 1);

        // reading the label leaves the session at the same position
        read_media_label(&mut session).unwrap().unwrap();
        assert_eq!(session.position().unwrap(), start);
    }
}
