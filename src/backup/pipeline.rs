//! Stream adapters of the backup pipeline: checksums and AEAD envelopes.
//!
//! On-tape nesting is `[compression [encryption [tar]]]` read right to
//! left on the write path: tar bytes get compressed, the compressed
//! stream gets wrapped into one AES-256-GCM envelope
//! `[12 byte nonce][ciphertext][16 byte tag]`.

use std::collections::HashMap;
use std::io::{Read, Write};

use anyhow::{bail, format_err, Error};
use openssl::symm::{Cipher, Crypter, Mode};

/// AEAD nonce length (bytes).
pub const ENVELOPE_NONCE_LEN: usize = 12;

/// AEAD tag length (bytes).
pub const ENVELOPE_TAG_LEN: usize = 16;

/// Resolves encryption key material by fingerprint.
///
/// The engine refuses to run when the key for a set is absent.
pub trait KeyStore: Send + Sync {
    fn lookup(&self, fingerprint: &str) -> Result<Option<[u8; 32]>, Error>;
}

/// Fingerprint of a key: hex SHA-256 over the raw key material.
pub fn key_fingerprint(key: &[u8; 32]) -> String {
    hex::encode(openssl::sha::sha256(key))
}

/// In-memory key store.
#[derive(Default)]
pub struct StaticKeyStore {
    keys: HashMap<String, [u8; 32]>,
}

impl StaticKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, returning its fingerprint.
    pub fn insert(&mut self, key: [u8; 32]) -> String {
        let fingerprint = key_fingerprint(&key);
        self.keys.insert(fingerprint.clone(), key);
        fingerprint
    }
}

impl KeyStore for StaticKeyStore {
    fn lookup(&self, fingerprint: &str) -> Result<Option<[u8; 32]>, Error> {
        Ok(self.keys.get(fingerprint).copied())
    }
}

/// Writer computing a SHA-256 digest of everything passing through.
pub struct ChecksumWriter<W> {
    writer: W,
    hasher: openssl::sha::Sha256,
    bytes: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: openssl::sha::Sha256::new(),
            bytes: 0,
        }
    }

    pub fn finish(self) -> (W, [u8; 32], u64) {
        (self.writer, self.hasher.finish(), self.bytes)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Reader computing a SHA-256 digest of everything passing through.
pub struct ChecksumReader<R> {
    reader: R,
    hasher: openssl::sha::Sha256,
    bytes: u64,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: openssl::sha::Sha256::new(),
            bytes: 0,
        }
    }

    pub fn finish(self) -> (R, [u8; 32], u64) {
        (self.reader, self.hasher.finish(), self.bytes)
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

fn crypt_err(err: openssl::error::ErrorStack) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("cipher failed - {}", err))
}

/// AES-256-GCM envelope writer.
///
/// Emits the nonce up front, streams ciphertext, and appends the tag on
/// `finish`.
pub struct CryptWriter<W> {
    writer: W,
    crypter: Crypter,
    buffer: Box<[u8; 64 * 1024]>,
}

impl<W: Write> CryptWriter<W> {
    pub fn new(mut writer: W, key: &[u8; 32]) -> Result<Self, Error> {
        let mut nonce = [0u8; ENVELOPE_NONCE_LEN];
        openssl::rand::rand_bytes(&mut nonce)?;

        let crypter = Crypter::new(Cipher::aes_256_gcm(), Mode::Encrypt, key, Some(&nonce))?;
        writer.write_all(&nonce)?;

        Ok(Self {
            writer,
            crypter,
            buffer: Box::new([0u8; 64 * 1024]),
        })
    }

    /// Flush the cipher, append the tag and return the inner writer.
    pub fn finish(mut self) -> Result<W, Error> {
        let rest = self.crypter.finalize(self.buffer.as_mut())?;
        if rest > 0 {
            self.writer.write_all(&self.buffer[..rest])?;
        }
        let mut tag = [0u8; ENVELOPE_TAG_LEN];
        self.crypter.get_tag(&mut tag)?;
        self.writer.write_all(&tag)?;
        Ok(self.writer)
    }
}

impl<W: Write> Write for CryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let take = buf.len().min(self.buffer.len() - Cipher::aes_256_gcm().block_size());
        let count = self
            .crypter
            .update(&buf[..take], self.buffer.as_mut())
            .map_err(crypt_err)?;
        self.writer.write_all(&self.buffer[..count])?;
        Ok(take)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// AES-256-GCM envelope reader.
///
/// Needs the exact envelope length to locate the trailing tag; the
/// catalog records the stream length of every set.
pub struct CryptReader<R> {
    reader: R,
    crypter: Option<Crypter>,
    key: [u8; 32],
    ciphertext_remaining: u64,
    finalized: bool,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<R: Read> CryptReader<R> {
    pub fn new(reader: R, key: &[u8; 32], envelope_len: u64) -> Result<Self, Error> {
        let overhead = (ENVELOPE_NONCE_LEN + ENVELOPE_TAG_LEN) as u64;
        if envelope_len < overhead {
            bail!("encrypted stream shorter than envelope overhead");
        }
        Ok(Self {
            reader,
            crypter: None,
            key: *key,
            ciphertext_remaining: envelope_len - overhead,
            finalized: false,
            pending: Vec::new(),
            pending_pos: 0,
        })
    }

    /// Verify the tag was seen and valid, returning the inner reader.
    pub fn finish(self) -> Result<R, Error> {
        if !self.finalized {
            bail!("encrypted stream not fully read - tag unverified");
        }
        Ok(self.reader)
    }

    fn refill(&mut self) -> std::io::Result<()> {
        self.pending.clear();
        self.pending_pos = 0;

        if self.crypter.is_none() {
            let mut nonce = [0u8; ENVELOPE_NONCE_LEN];
            self.reader.read_exact(&mut nonce)?;
            let crypter =
                Crypter::new(Cipher::aes_256_gcm(), Mode::Decrypt, &self.key, Some(&nonce))
                    .map_err(crypt_err)?;
            self.crypter = Some(crypter);
        }

        if self.ciphertext_remaining > 0 {
            let mut chunk = [0u8; 64 * 1024];
            let want = (self.ciphertext_remaining).min((chunk.len() - 64) as u64) as usize;
            self.reader.read_exact(&mut chunk[..want])?;
            self.ciphertext_remaining -= want as u64;

            self.pending.resize(want + Cipher::aes_256_gcm().block_size(), 0);
            let crypter = self.crypter.as_mut().expect("crypter initialized above");
            let count = crypter
                .update(&chunk[..want], &mut self.pending)
                .map_err(crypt_err)?;
            self.pending.truncate(count);
            return Ok(());
        }

        if !self.finalized {
            let mut tag = [0u8; ENVELOPE_TAG_LEN];
            self.reader.read_exact(&mut tag)?;
            let crypter = self.crypter.as_mut().expect("crypter initialized above");
            crypter.set_tag(&tag).map_err(crypt_err)?;
            self.pending.resize(Cipher::aes_256_gcm().block_size() + 64, 0);
            let count = crypter.finalize(&mut self.pending).map_err(|err| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("AEAD tag verification failed - {}", err),
                )
            })?;
            self.pending.truncate(count);
            self.finalized = true;
        }
        Ok(())
    }
}

impl<R: Read> Read for CryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pending_pos < self.pending.len() {
                let take = (self.pending.len() - self.pending_pos).min(buf.len());
                buf[..take]
                    .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
                self.pending_pos += take;
                return Ok(take);
            }
            if self.finalized {
                return Ok(0);
            }
            self.refill()?;
            if self.pending.is_empty() && self.finalized {
                return Ok(0);
            }
        }
    }
}

/// Suffix carried by per-file encrypted entries on tape.
pub const ENCRYPTED_FILE_SUFFIX: &str = ".enc";

/// Envelope size overhead: nonce plus tag (GCM keeps length).
pub const ENVELOPE_OVERHEAD: u64 = (ENVELOPE_NONCE_LEN + ENVELOPE_TAG_LEN) as u64;

/// Streams one file as its own `[nonce][ciphertext][tag]` envelope.
///
/// Used by the per-file encryption mode, where every tar entry is an
/// independently decryptable envelope and carries the `.enc` suffix.
pub struct EnvelopeReader<R> {
    inner: R,
    crypter: Crypter,
    pending: Vec<u8>,
    pending_pos: usize,
    body_done: bool,
    tag_done: bool,
}

impl<R: Read> EnvelopeReader<R> {
    pub fn new(inner: R, key: &[u8; 32]) -> Result<Self, Error> {
        let mut nonce = [0u8; ENVELOPE_NONCE_LEN];
        openssl::rand::rand_bytes(&mut nonce)?;
        let crypter = Crypter::new(Cipher::aes_256_gcm(), Mode::Encrypt, key, Some(&nonce))?;
        Ok(Self {
            inner,
            crypter,
            pending: nonce.to_vec(),
            pending_pos: 0,
            body_done: false,
            tag_done: false,
        })
    }

    /// Hand back the plaintext reader (for checksum collection).
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn refill(&mut self) -> std::io::Result<()> {
        self.pending.clear();
        self.pending_pos = 0;

        if !self.body_done {
            let mut chunk = [0u8; 64 * 1024];
            let n = self.inner.read(&mut chunk)?;
            if n > 0 {
                self.pending
                    .resize(n + Cipher::aes_256_gcm().block_size(), 0);
                let count = self
                    .crypter
                    .update(&chunk[..n], &mut self.pending)
                    .map_err(crypt_err)?;
                self.pending.truncate(count);
                return Ok(());
            }
            self.body_done = true;
        }

        if !self.tag_done {
            self.pending
                .resize(Cipher::aes_256_gcm().block_size() + ENVELOPE_TAG_LEN, 0);
            let count = self.crypter.finalize(&mut self.pending).map_err(crypt_err)?;
            self.pending.truncate(count);
            let mut tag = [0u8; ENVELOPE_TAG_LEN];
            self.crypter.get_tag(&mut tag).map_err(crypt_err)?;
            self.pending.extend_from_slice(&tag);
            self.tag_done = true;
        }
        Ok(())
    }
}

impl<R: Read> Read for EnvelopeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pending_pos < self.pending.len() {
                let take = (self.pending.len() - self.pending_pos).min(buf.len());
                buf[..take]
                    .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
                self.pending_pos += take;
                return Ok(take);
            }
            if self.tag_done {
                return Ok(0);
            }
            self.refill()?;
        }
    }
}

/// Look up the key for a set, refusing to proceed without it.
pub fn require_key(key_store: &dyn KeyStore, fingerprint: &str) -> Result<[u8; 32], Error> {
    key_store
        .lookup(fingerprint)?
        .ok_or_else(|| format_err!("encryption key '{}' not available", fingerprint))
}
