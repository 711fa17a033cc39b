//! Demultiplexing of per-set tar streams.
//!
//! Two read strategies exist, matching the two write layouts:
//!
//! - aligned: plain sets pad the tar stream to a device-block boundary
//!   before every file, so each catalog entry is directly addressable.
//!   The reader streams forward from the first wanted entry, skipping
//!   the gaps (one seek per tape, as the planner promises).
//! - sequential: compressed and/or encrypted sets are one contiguous
//!   envelope; the decoded stream is walked entry by entry and wanted
//!   files are picked out by path.

use std::collections::HashMap;
use std::io::{self, Read};

use anyhow::{bail, format_err, Error};

use tba_api_types::CatalogEntry;

/// Reader counting consumed bytes, for absolute skip computation.
pub(crate) struct CountingReader<R> {
    reader: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// A wanted file at its absolute position in the (possibly
/// multi-volume) stream.
pub(crate) struct AlignedTarget {
    /// Byte position of the file's tar header relative to stream start.
    pub stream_pos: u64,
    pub entry: CatalogEntry,
}

/// Walk an aligned stream, handing each wanted file's content reader to
/// `sink`. Targets must be sorted by `stream_pos`.
pub(crate) fn demux_aligned<R, F>(
    reader: R,
    targets: &[AlignedTarget],
    mut sink: F,
) -> Result<(), Error>
where
    R: Read,
    F: FnMut(&CatalogEntry, &mut dyn Read) -> Result<(), Error>,
{
    let mut counting = CountingReader::new(reader);

    for target in targets {
        if target.stream_pos < counting.count() {
            bail!("restore targets out of order - internal error");
        }
        let skip = target.stream_pos - counting.count();
        io::copy(&mut (&mut counting).take(skip), &mut io::sink())?;

        read_one_entry(&mut counting, &target.entry, &mut sink)?;
    }
    Ok(())
}

/// Read exactly one tar entry at the current position.
fn read_one_entry<R, F>(
    reader: &mut CountingReader<R>,
    entry: &CatalogEntry,
    sink: &mut F,
) -> Result<(), Error>
where
    R: Read,
    F: FnMut(&CatalogEntry, &mut dyn Read) -> Result<(), Error>,
{
    let mut archive = tar::Archive::new(reader);
    let mut entries = archive.entries()?;
    let mut tar_entry = entries
        .next()
        .ok_or_else(|| format_err!("tape stream ended before '{}'", entry.file_path))??;

    let header_path = tar_entry.path()?.to_string_lossy().into_owned();
    if header_path != entry.file_path {
        bail!(
            "tape stream out of sync: expected '{}', found '{}'",
            entry.file_path,
            header_path
        );
    }
    if tar_entry.size() != entry.file_size {
        bail!(
            "size mismatch for '{}': catalog says {}, tape says {}",
            entry.file_path,
            entry.file_size,
            tar_entry.size()
        );
    }

    sink(entry, &mut tar_entry)?;

    // drain whatever the sink left unread, the next skip is absolute
    io::copy(&mut tar_entry, &mut io::sink())?;
    Ok(())
}

/// Walk a sequential (enveloped) stream, handing each wanted file to
/// `sink`. Stops early once every wanted file was seen.
pub(crate) fn demux_sequential<R, F>(
    reader: R,
    wanted: &HashMap<String, CatalogEntry>,
    mut sink: F,
) -> Result<usize, Error>
where
    R: Read,
    F: FnMut(&CatalogEntry, &mut dyn Read) -> Result<(), Error>,
{
    let mut archive = tar::Archive::new(reader);
    let mut found = 0;

    for tar_entry in archive.entries()? {
        let mut tar_entry = tar_entry?;
        let path = tar_entry.path()?.to_string_lossy().into_owned();

        if let Some(entry) = wanted.get(&path) {
            if tar_entry.size() != entry.file_size {
                bail!(
                    "size mismatch for '{}': catalog says {}, tape says {}",
                    path,
                    entry.file_size,
                    tar_entry.size()
                );
            }
            sink(entry, &mut tar_entry)?;
            io::copy(&mut tar_entry, &mut io::sink())?;
            found += 1;
            if found == wanted.len() {
                break;
            }
        }
    }

    if found != wanted.len() {
        bail!(
            "tape stream ended with {} of {} wanted files found",
            found,
            wanted.len()
        );
    }
    Ok(found)
}
