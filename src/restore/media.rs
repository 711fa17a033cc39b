//! Multi-volume media reader.
//!
//! Presents the (possibly spanning) on-tape stream of one backup set as
//! a single `Read`. Volumes are opened lazily through a
//! [`VolumeSource`], which owns the operator interaction when the wrong
//! tape is loaded.

use std::io::{self, Read};

use anyhow::Error;
use uuid::Uuid;

use tba_api_types::Id;
use tba_tape::{BlockReadError, DeviceSession};

/// One tape's portion of the stream.
#[derive(Clone, Debug)]
pub struct VolumeSpec {
    pub tape_id: Id,
    pub tape_label: String,
    pub expected_uuid: Uuid,
    /// First block to read.
    pub start_block: u64,
    /// Bytes to serve from this volume; `None` reads to the filemark.
    pub limit: Option<u64>,
}

/// Opens the session for each requested volume.
///
/// Implementations verify the loaded tape's label and park the run with
/// a wrong-tape change request until the operator provides the right
/// cartridge.
pub trait VolumeSource {
    fn open_volume(&mut self, spec: &VolumeSpec) -> Result<DeviceSession, Error>;
}

pub struct MediaReader<'a> {
    volumes: std::collections::VecDeque<VolumeSpec>,
    source: &'a mut dyn VolumeSource,
    session: Option<DeviceSession>,
    remaining: Option<u64>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    at_end: bool,
}

impl<'a> MediaReader<'a> {
    pub fn new(volumes: Vec<VolumeSpec>, source: &'a mut dyn VolumeSource) -> Self {
        Self {
            volumes: volumes.into(),
            source,
            session: None,
            remaining: None,
            buffer: Vec::new(),
            buffer_pos: 0,
            at_end: false,
        }
    }

    fn open_next_volume(&mut self) -> io::Result<bool> {
        // close the previous session before asking for the next tape
        self.session = None;

        let spec = match self.volumes.pop_front() {
            Some(spec) => spec,
            None => return Ok(false),
        };

        let mut session = self
            .source
            .open_volume(&spec)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("{:#}", err)))?;
        session
            .seek_block(spec.start_block)
            .map_err(io::Error::from)?;

        self.remaining = spec.limit;
        self.session = Some(session);
        self.buffer.clear();
        self.buffer_pos = 0;
        Ok(true)
    }

    fn fill_buffer(&mut self) -> io::Result<()> {
        loop {
            if self.at_end {
                return Ok(());
            }

            if self.session.is_none() && !self.open_next_volume()? {
                self.at_end = true;
                return Ok(());
            }

            if let Some(0) = self.remaining {
                // this volume is exhausted, move on
                self.session = None;
                continue;
            }

            let session = self.session.as_mut().expect("session opened above");
            let block_size = session.block_size();
            self.buffer.resize(block_size, 0);
            self.buffer_pos = 0;

            match session.read_block(&mut self.buffer) {
                Ok(n) => {
                    self.buffer.truncate(n);
                    if let Some(remaining) = &mut self.remaining {
                        if (self.buffer.len() as u64) > *remaining {
                            self.buffer.truncate(*remaining as usize);
                        }
                        *remaining -= self.buffer.len() as u64;
                    }
                    return Ok(());
                }
                Err(BlockReadError::FileMark) | Err(BlockReadError::EndOfData) => {
                    self.buffer.clear();
                    self.session = None;
                }
                Err(BlockReadError::Device(err)) => {
                    self.buffer.clear();
                    return Err(err.into());
                }
            }
        }
    }
}

impl Read for MediaReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buffer_pos == self.buffer.len() {
            self.fill_buffer()?;
            if self.at_end && self.buffer.is_empty() {
                return Ok(0);
            }
            if self.buffer.is_empty() {
                return self.read(out);
            }
        }
        let take = (self.buffer.len() - self.buffer_pos).min(out.len());
        out[..take].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + take]);
        self.buffer_pos += take;
        Ok(take)
    }
}
