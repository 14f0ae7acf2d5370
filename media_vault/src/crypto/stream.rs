//! Media Vault - Streaming AEAD
//!
//! Blob format:
//! ```text
//! [MAGIC 8B]["MVBLOB02"]
//! [NONCE 12B][random, fresh per write]
//! [CIPHERTEXT variable][ChaCha20]
//! [TAG 16B][Poly1305 over AAD || CIPHERTEXT]
//! ```
//!
//! ChaCha20-Poly1305 (RFC 8439) computed incrementally, so the output is
//! byte-identical to a one-shot seal with the same key, nonce and AAD. The
//! AAD is the blob name.
//!
//! Plaintext is released as it is decrypted; it is authentic only once the
//! reader has returned end-of-stream. Image consumers read to the end.
//! Video consumers seek by sequential discard (see [`DecryptingReader::skip`]).

use std::io::{self, Read, Write};

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::{ChaCha20, Key, Nonce};
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::{Block, Poly1305};
use zeroize::Zeroizing;

use super::keys::{generate_nonce, VaultKey, NONCE_LEN};
use crate::error::{BlobFault, StreamFault, VaultResult};

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Magic bytes of the current blob format
pub const MAGIC: &[u8; 8] = b"MVBLOB02";

/// Poly1305 tag size
pub const TAG_LEN: usize = 16;

/// Header size: MAGIC(8) + NONCE(12)
pub const HEADER_LEN: usize = MAGIC.len() + NONCE_LEN;

/// Bytes added to the plaintext length
pub const OVERHEAD: usize = HEADER_LEN + TAG_LEN;

/// Read granularity of the decrypting reader
const READ_CHUNK: usize = 64 * 1024;

/// Write granularity of the encrypting writer
const WRITE_CHUNK: usize = 64 * 1024;

/// Which scheme a blob was written with, judged by its framing alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobFormat {
    Current,
    /// No current magic. Legacy unless it fails to open under the legacy key.
    Legacy,
    /// Too short to be either
    Unrecognized,
}

/// Classify a blob by its leading bytes
pub fn detect_format(header: &[u8]) -> BlobFormat {
    if header.len() < MAGIC.len() {
        BlobFormat::Unrecognized
    } else if &header[..MAGIC.len()] == MAGIC {
        BlobFormat::Current
    } else {
        BlobFormat::Legacy
    }
}

/// Plaintext length of a current-format blob of `blob_len` bytes
pub fn plaintext_len(blob_len: u64) -> Option<u64> {
    blob_len.checked_sub(OVERHEAD as u64)
}

// ═══════════════════════════════════════════════════════════════════════════
// Cipher state
// ═══════════════════════════════════════════════════════════════════════════

/// ChaCha20 positioned at block 1 plus a Poly1305 keyed from block 0
fn init_cipher(key: &VaultKey, nonce: &[u8; NONCE_LEN]) -> (ChaCha20, Poly1305) {
    let mut cipher = ChaCha20::new(Key::from_slice(key.expose()), Nonce::from_slice(nonce));

    let mut mac_key = Zeroizing::new([0u8; 32]);
    cipher.apply_keystream(&mut *mac_key);
    let mac = Poly1305::new(poly1305::Key::from_slice(&*mac_key));

    cipher.seek(64u64);
    (cipher, mac)
}

/// Poly1305 over `AAD || pad16 || CT || pad16 || len(AAD) || len(CT)`,
/// fed in arbitrary-sized pieces.
struct TagState {
    mac: Poly1305,
    partial: [u8; 16],
    partial_len: usize,
    aad_len: u64,
    ct_len: u64,
}

impl TagState {
    fn new(mut mac: Poly1305, aad: &[u8]) -> Self {
        mac.update_padded(aad);
        Self {
            mac,
            partial: [0u8; 16],
            partial_len: 0,
            aad_len: aad.len() as u64,
            ct_len: 0,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        self.ct_len += data.len() as u64;

        if self.partial_len > 0 {
            let take = (16 - self.partial_len).min(data.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];

            if self.partial_len < 16 {
                return;
            }
            self.mac.update(&[Block::clone_from_slice(&self.partial)]);
            self.partial_len = 0;
        }

        let whole = data.len() - data.len() % 16;
        for block in data[..whole].chunks_exact(16) {
            self.mac.update(&[Block::clone_from_slice(block)]);
        }

        let rest = &data[whole..];
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }

    /// Absorb the padded tail and the length block
    fn close(&mut self) {
        self.mac.update_padded(&self.partial[..self.partial_len]);
        self.partial_len = 0;

        let mut lengths = Block::default();
        lengths[..8].copy_from_slice(&self.aad_len.to_le_bytes());
        lengths[8..].copy_from_slice(&self.ct_len.to_le_bytes());
        self.mac.update(&[lengths]);
    }

    fn finalize(mut self) -> Block {
        self.close();
        self.mac.finalize()
    }

    /// Constant-time check against a received tag
    fn verify(mut self, expected: &[u8]) -> bool {
        if expected.len() != TAG_LEN {
            return false;
        }
        self.close();
        self.mac.verify(Block::from_slice(expected)).is_ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Encrypting sink
// ═══════════════════════════════════════════════════════════════════════════

/// Encrypts everything written to it into `inner`.
///
/// The header is written on construction; [`finish`](Self::finish) writes
/// the tag. Dropping without `finish` leaves an unauthenticated blob, which
/// is why callers write into a temp file and rename only after `finish`.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: ChaCha20,
    tag: TagState,
    buf: Vec<u8>,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(key: &VaultKey, aad: &[u8], mut inner: W) -> io::Result<Self> {
        let nonce = generate_nonce();
        inner.write_all(MAGIC)?;
        inner.write_all(&nonce)?;

        let (cipher, mac) = init_cipher(key, &nonce);
        Ok(Self {
            inner,
            cipher,
            tag: TagState::new(mac, aad),
            buf: Vec::with_capacity(WRITE_CHUNK),
        })
    }

    /// Write the authentication tag and hand back the sink
    pub fn finish(mut self) -> io::Result<W> {
        let tag = self.tag.finalize();
        self.inner.write_all(&tag)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = data.len().min(WRITE_CHUNK);
        self.buf.clear();
        self.buf.extend_from_slice(&data[..n]);

        self.cipher.apply_keystream(&mut self.buf);
        self.tag.update(&self.buf);
        self.inner.write_all(&self.buf)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Decrypting source
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Streaming,
    Verified,
    Failed(StreamFault),
}

/// Decrypts a current-format blob as a forward-only byte stream.
///
/// The trailing [`TAG_LEN`] bytes are always held back until the source is
/// exhausted; at that point the tag is checked and `read` returns `Ok(0)`
/// or an `InvalidData` error carrying a [`BlobFault`].
pub struct DecryptingReader<R: Read> {
    inner: R,
    blob: String,
    cipher: ChaCha20,
    tag: Option<TagState>,
    pending: Vec<u8>,
    head: usize,
    eof: bool,
    state: ReadState,
    position: u64,
}

impl<R: Read> DecryptingReader<R> {
    /// Read and check the header. `aad` must be the name the blob was written under.
    pub fn new(key: &VaultKey, aad: &str, mut inner: R) -> VaultResult<Self> {
        let mut header = [0u8; HEADER_LEN];
        if let Err(e) = inner.read_exact(&mut header) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Err(BlobFault::new(aad, StreamFault::TruncatedStream).into());
            }
            return Err(e.into());
        }

        if detect_format(&header) != BlobFormat::Current {
            return Err(BlobFault::new(aad, StreamFault::UnrecognizedFormat).into());
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&header[MAGIC.len()..]);
        let (cipher, mac) = init_cipher(key, &nonce);

        Ok(Self {
            inner,
            blob: aad.to_string(),
            cipher,
            tag: Some(TagState::new(mac, aad.as_bytes())),
            pending: Vec::with_capacity(READ_CHUNK + TAG_LEN),
            head: 0,
            eof: false,
            state: ReadState::Streaming,
            position: 0,
        })
    }

    /// Plaintext bytes returned so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// True once the tag has been checked successfully
    pub fn is_verified(&self) -> bool {
        self.state == ReadState::Verified
    }

    /// Advance by reading and discarding `n` plaintext bytes.
    ///
    /// A single AEAD stream has no random access; reaching offset N costs
    /// decrypting N bytes. Returns how many bytes were skipped, which is
    /// less than `n` only at end of stream.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        io::copy(&mut self.by_ref().take(n), &mut io::sink())
    }

    fn fault(&self, fault: StreamFault) -> io::Error {
        BlobFault::new(&self.blob, fault).into_io()
    }

    fn buffered(&self) -> &[u8] {
        &self.pending[self.head..]
    }

    fn fill(&mut self) -> io::Result<()> {
        if self.head > 0 {
            self.pending.drain(..self.head);
            self.head = 0;
        }

        let start = self.pending.len();
        self.pending.resize(start + READ_CHUNK, 0);

        let read = loop {
            match self.inner.read(&mut self.pending[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.pending.truncate(start);
                    return Err(e);
                }
            }
        };

        self.pending.truncate(start + read);
        if read == 0 {
            self.eof = true;
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        match self.state {
            ReadState::Verified => return Ok(()),
            ReadState::Failed(fault) => return Err(self.fault(fault)),
            ReadState::Streaming => {}
        }

        let outcome = match self.tag.take() {
            Some(tag) => {
                let received = self.buffered();
                if received.len() < TAG_LEN {
                    Err(StreamFault::TruncatedStream)
                } else if tag.verify(received) {
                    Ok(())
                } else {
                    Err(StreamFault::AuthenticationFailed)
                }
            }
            None => Err(StreamFault::AuthenticationFailed),
        };
        self.pending.clear();
        self.head = 0;

        match outcome {
            Ok(()) => {
                self.state = ReadState::Verified;
                Ok(())
            }
            Err(fault) => {
                log::warn!("blob {} failed verification: {}", self.blob, fault);
                self.state = ReadState::Failed(fault);
                Err(self.fault(fault))
            }
        }
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            if self.state != ReadState::Streaming {
                self.finish()?;
                return Ok(0);
            }

            let available = self.buffered().len();
            if available > TAG_LEN {
                let n = out.len().min(available - TAG_LEN);
                let chunk = &mut out[..n];
                chunk.copy_from_slice(&self.pending[self.head..self.head + n]);
                self.head += n;

                if let Some(tag) = self.tag.as_mut() {
                    tag.update(chunk);
                }
                self.cipher.apply_keystream(chunk);
                self.position += n as u64;
                return Ok(n);
            }

            if self.eof {
                self.finish()?;
                return Ok(0);
            }

            self.fill()?;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Whole-buffer helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Encrypt a buffer into a complete blob
pub fn seal_to_vec(key: &VaultKey, aad: &str, plaintext: &[u8]) -> io::Result<Vec<u8>> {
    let out = Vec::with_capacity(plaintext.len() + OVERHEAD);
    let mut writer = EncryptingWriter::new(key, aad.as_bytes(), out)?;
    writer.write_all(plaintext)?;
    writer.finish()
}

/// Decrypt and authenticate a complete blob
pub fn open_to_vec(key: &VaultKey, aad: &str, blob: &[u8]) -> VaultResult<Zeroizing<Vec<u8>>> {
    let mut reader = DecryptingReader::new(key, aad, blob)?;
    let mut plaintext = Zeroizing::new(Vec::with_capacity(blob.len().saturating_sub(OVERHEAD)));
    reader.read_to_end(&mut plaintext)?;
    Ok(plaintext)
}
