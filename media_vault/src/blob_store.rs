//! Media Vault - Encrypted Blob Store
//!
//! Maps logical items to encrypted blobs by stable name and serves them as
//! streams. Every write is encrypt → temp → fsync → rename, so a blob is
//! either its old content or its new content, never a mix.
//!
//! Naming:
//! ```text
//! <uuid>.<ext>       primary (image or video)
//! <uuid>.<ext>.tn    thumbnail
//! <uuid>.<ext>.vp    video preview
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::catalog::Catalog;
use crate::crypto::stream::{plaintext_len, detect_format, BlobFormat, DecryptingReader, EncryptingWriter};
use crate::crypto::legacy::{self, MIN_LEGACY_LEN};
use crate::crypto::VaultKey;
use crate::error::{VaultError, VaultResult};
use crate::key_holder::{KeySource, VaultKeyHolder};
use crate::storage::{BlobBackend, StagedBlob};

/// Reader over a stored blob
pub type BlobReader = DecryptingReader<Box<dyn Read + Send>>;

// ═══════════════════════════════════════════════════════════════════════════
// BLOB NAMES
// ═══════════════════════════════════════════════════════════════════════════

/// Which rendition of an item a blob holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlobRole {
    Primary,
    Thumbnail,
    VideoPreview,
}

impl BlobRole {
    pub const ALL: [BlobRole; 3] = [BlobRole::Primary, BlobRole::Thumbnail, BlobRole::VideoPreview];

    fn suffix(self) -> Option<&'static str> {
        match self {
            BlobRole::Primary => None,
            BlobRole::Thumbnail => Some("tn"),
            BlobRole::VideoPreview => Some("vp"),
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "tn" => Some(BlobRole::Thumbnail),
            "vp" => Some(BlobRole::VideoPreview),
            _ => None,
        }
    }
}

/// Validated blob name. Never contains a path separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobName {
    uuid: Uuid,
    ext: String,
    role: BlobRole,
}

impl BlobName {
    pub fn new(uuid: Uuid, ext: &str, role: BlobRole) -> VaultResult<Self> {
        if !valid_extension(ext) {
            return Err(VaultError::InvalidBlobName(format!("bad extension {:?}", ext)));
        }
        Ok(Self {
            uuid,
            ext: ext.to_string(),
            role,
        })
    }

    /// Parse `<uuid>.<ext>[.tn|.vp]`
    pub fn parse(name: &str) -> VaultResult<Self> {
        let invalid = || VaultError::InvalidBlobName(name.to_string());

        let mut parts = name.split('.');
        let (stem, ext) = match (parts.next(), parts.next()) {
            (Some(stem), Some(ext)) => (stem, ext),
            _ => return Err(invalid()),
        };
        let role = match parts.next() {
            None => BlobRole::Primary,
            Some(suffix) => BlobRole::from_suffix(suffix).ok_or_else(invalid)?,
        };
        if parts.next().is_some() || !valid_extension(ext) {
            return Err(invalid());
        }

        // Canonical lowercase hyphenated form only, so names round-trip
        let uuid = Uuid::parse_str(stem).map_err(|_| invalid())?;
        if uuid.hyphenated().to_string() != stem {
            return Err(invalid());
        }

        Ok(Self {
            uuid,
            ext: ext.to_string(),
            role,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn role(&self) -> BlobRole {
        self.role
    }

    pub fn extension(&self) -> &str {
        &self.ext
    }
}

impl fmt::Display for BlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.uuid.hyphenated(), self.ext)?;
        if let Some(suffix) = self.role.suffix() {
            write!(f, ".{}", suffix)?;
        }
        Ok(())
    }
}

pub(crate) fn valid_extension(ext: &str) -> bool {
    !ext.is_empty() && ext.len() <= 16 && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Outcome of a full integrity scan
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub failed: Vec<(String, VaultError)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Blobs without the current magic, sorted by the legacy key
#[derive(Debug, Default)]
pub struct LegacyScan {
    /// Open under the legacy key
    pub legacy: Vec<BlobName>,
    /// Neither current nor legacy; damaged
    pub unreadable: Vec<(BlobName, VaultError)>,
}

// ═══════════════════════════════════════════════════════════════════════════
// STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Encrypted blob store
pub struct VaultFileStore {
    backend: Arc<dyn BlobBackend>,
    keys: Arc<VaultKeyHolder>,
    extension: String,
    /// Shared: per-item operations. Exclusive: vault-wide rewrites.
    namespace: RwLock<()>,
    /// Serializes writers of the same name
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VaultFileStore {
    /// Open a store and remove temps left by interrupted writes
    pub fn open(
        backend: Arc<dyn BlobBackend>,
        keys: Arc<VaultKeyHolder>,
        extension: &str,
    ) -> VaultResult<Self> {
        if !valid_extension(extension) {
            return Err(VaultError::InvalidBlobName(format!(
                "bad extension {:?}",
                extension
            )));
        }

        backend.cleanup_stale_temps()?;

        Ok(Self {
            backend,
            keys,
            extension: extension.to_string(),
            namespace: RwLock::new(()),
            name_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn keys(&self) -> &Arc<VaultKeyHolder> {
        &self.keys
    }

    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    pub fn name_for(&self, uuid: Uuid, role: BlobRole) -> BlobName {
        BlobName {
            uuid,
            ext: self.extension.clone(),
            role,
        }
    }

    fn shared(&self) -> VaultResult<RwLockReadGuard<'_, ()>> {
        self.namespace.try_read().ok_or(VaultError::Busy)
    }

    /// Take the vault-wide exclusive lock. `Busy` if any other operation holds it.
    pub fn exclusive(&self) -> VaultResult<ExclusiveAccess<'_>> {
        let guard = self.namespace.try_write().ok_or(VaultError::Busy)?;
        Ok(ExclusiveAccess {
            store: self,
            _guard: guard,
        })
    }

    fn with_name_lock<T>(&self, name: &str, f: impl FnOnce() -> VaultResult<T>) -> VaultResult<T> {
        let lock = Arc::clone(
            self.name_locks
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );

        let result = {
            let _held = lock.lock();
            f()
        };

        let mut locks = self.name_locks.lock();
        // Map entry plus ours: nobody else is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(name);
        }
        result
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PER-ITEM OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt `plaintext` into the blob `name`, replacing any previous
    /// content atomically. Returns the plaintext length.
    pub fn write<R: Read>(&self, name: &BlobName, mut plaintext: R) -> VaultResult<u64> {
        let _shared = self.shared()?;
        let name = name.to_string();

        self.with_name_lock(&name, || {
            let session = KeySource::Session(&*self.keys);
            let (staged, written) = stage_encrypted(&*self.backend, &name, session, &mut plaintext)?;
            staged.commit()?;
            log::debug!("Wrote {} ({} bytes)", name, written);
            Ok(written)
        })
    }

    /// Open a blob for streaming. `None` if it does not exist.
    ///
    /// Plaintext is authentic only once the reader reaches end of stream.
    pub fn read(&self, name: &BlobName) -> VaultResult<Option<BlobReader>> {
        self.open_reader(&name.to_string())
    }

    /// Read and authenticate a whole blob
    pub fn read_to_vec(&self, name: &BlobName) -> VaultResult<Option<Zeroizing<Vec<u8>>>> {
        let Some(mut reader) = self.read(name)? else {
            return Ok(None);
        };

        let mut plaintext = Zeroizing::new(Vec::new());
        reader.read_to_end(&mut plaintext)?;
        Ok(Some(plaintext))
    }

    /// Open a blob for playback with seek support
    pub fn open_seekable(self: &Arc<Self>, name: &BlobName) -> VaultResult<Option<SeekableBlob>> {
        let raw_name = name.to_string();

        let Some(stored) = self.backend.len(&raw_name)? else {
            return Ok(None);
        };
        let len = plaintext_len(stored).ok_or_else(|| VaultError::TruncatedStream {
            blob: raw_name.clone(),
        })?;

        let Some(reader) = self.open_reader(&raw_name)? else {
            return Ok(None);
        };

        Ok(Some(SeekableBlob {
            store: Arc::clone(self),
            name: raw_name,
            len,
            reader,
        }))
    }

    /// Remove a blob. Deleting a missing blob is not an error.
    pub fn delete(&self, name: &BlobName) -> VaultResult<()> {
        let _shared = self.shared()?;
        let name = name.to_string();
        self.with_name_lock(&name, || self.backend.delete(&name))
    }

    pub fn exists(&self, name: &BlobName) -> VaultResult<bool> {
        Ok(self.backend.len(&name.to_string())?.is_some())
    }

    fn open_reader(&self, name: &str) -> VaultResult<Option<BlobReader>> {
        let _shared = self.shared()?;

        let Some(raw) = self.backend.open_read(name)? else {
            return Ok(None);
        };
        self.keys
            .with_key(|key| DecryptingReader::new(key, name, raw))
            .map(Some)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ENUMERATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Every committed blob with a valid name
    pub fn list(&self) -> VaultResult<Vec<BlobName>> {
        list_names(&*self.backend)
    }

    /// Format of a stored blob by its header
    pub fn format_of(&self, name: &BlobName) -> VaultResult<Option<BlobFormat>> {
        detect_blob(&*self.backend, &name.to_string())
    }

    /// Blobs framed like the legacy format. Damaged current blobs show up
    /// here too until a [`LegacyScan`] tells them apart.
    pub fn legacy_blobs(&self) -> VaultResult<Vec<BlobName>> {
        legacy_names(&*self.backend)
    }

    pub fn needs_migration(&self) -> VaultResult<bool> {
        Ok(!self.legacy_blobs()?.is_empty())
    }

    /// Existing blobs of every item the catalog knows
    pub fn blobs_for_catalog(&self, catalog: &dyn Catalog) -> VaultResult<Vec<BlobName>> {
        let stored: BTreeSet<BlobName> = self.list()?.into_iter().collect();

        let mut names = Vec::new();
        for uuid in catalog.all_item_uuids() {
            for role in BlobRole::ALL {
                let name = self.name_for(uuid, role);
                if stored.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    /// Blobs whose item the catalog does not know
    pub fn orphans(&self, catalog: &dyn Catalog) -> VaultResult<Vec<BlobName>> {
        let known: BTreeSet<Uuid> = catalog.all_item_uuids().into_iter().collect();
        Ok(self
            .list()?
            .into_iter()
            .filter(|name| !known.contains(&name.uuid()))
            .collect())
    }

    /// Authenticate every blob end to end
    pub fn verify_all(&self) -> VaultResult<VerifyReport> {
        let mut report = VerifyReport::default();

        for name in self.list()? {
            report.checked += 1;
            let outcome = match self.read(&name) {
                Ok(Some(mut reader)) => io::copy(&mut reader, &mut io::sink())
                    .map(|_| ())
                    .map_err(VaultError::from),
                Ok(None) => Err(VaultError::BlobNotFound(name.to_string())),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {}
                Err(e @ (VaultError::VaultLocked | VaultError::Busy)) => return Err(e),
                Err(e) => {
                    log::warn!("Blob {} failed verification: {}", name, e);
                    report.failed.push((name.to_string(), e));
                }
            }
        }

        Ok(report)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EXCLUSIVE ACCESS
// ═══════════════════════════════════════════════════════════════════════════

/// Vault-wide exclusive lock with explicit-key blob access.
///
/// Held by rewrites, migration, export and import. Per-item operations
/// return `Busy` while it exists.
pub struct ExclusiveAccess<'a> {
    store: &'a VaultFileStore,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl ExclusiveAccess<'_> {
    pub fn list(&self) -> VaultResult<Vec<BlobName>> {
        list_names(&*self.store.backend)
    }

    pub fn legacy_blobs(&self) -> VaultResult<Vec<BlobName>> {
        legacy_names(&*self.store.backend)
    }

    /// Blobs with the current magic
    pub fn current_blobs(&self) -> VaultResult<Vec<BlobName>> {
        let backend = &*self.store.backend;
        let mut current = Vec::new();
        for name in list_names(backend)? {
            if detect_blob(backend, &name.to_string())? == Some(BlobFormat::Current) {
                current.push(name);
            }
        }
        Ok(current)
    }

    /// Try every legacy-framed blob under `legacy_key`
    pub fn scan_legacy(&self, legacy_key: &VaultKey) -> VaultResult<LegacyScan> {
        let mut scan = LegacyScan::default();

        for name in self.legacy_blobs()? {
            let raw_name = name.to_string();
            let blob = self.read_raw(&raw_name)?;
            match legacy::open(legacy_key, &blob, &raw_name) {
                Ok(_) => scan.legacy.push(name),
                Err(e) if e.is_authentication_error() || e.is_integrity_error() => {
                    log::warn!("Blob {} is neither current nor legacy: {}", raw_name, e);
                    scan.unreadable.push((name, e));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(scan)
    }

    pub fn exists(&self, name: &str) -> VaultResult<bool> {
        Ok(self.store.backend.len(name)?.is_some())
    }

    /// Current-format reader. The key is borrowed only for the header.
    pub fn open_decrypting<'k>(
        &self,
        name: &str,
        key: impl Into<KeySource<'k>>,
    ) -> VaultResult<BlobReader> {
        let raw = self
            .store
            .backend
            .open_read(name)?
            .ok_or_else(|| VaultError::BlobNotFound(name.to_string()))?;
        key.into().borrow(|key| DecryptingReader::new(key, name, raw))
    }

    /// Encrypt `plaintext` into a staged replacement of `name`
    pub fn stage_encrypted<'k>(
        &self,
        name: &str,
        key: impl Into<KeySource<'k>>,
        plaintext: &mut dyn Read,
    ) -> VaultResult<Box<dyn StagedBlob>> {
        stage_encrypted(&*self.store.backend, name, key.into(), plaintext).map(|(staged, _)| staged)
    }

    /// Stored bytes as they are on disk
    pub fn read_raw(&self, name: &str) -> VaultResult<Vec<u8>> {
        let mut raw = self
            .store
            .backend
            .open_read(name)?
            .ok_or_else(|| VaultError::BlobNotFound(name.to_string()))?;
        let mut data = Vec::new();
        raw.read_to_end(&mut data)?;
        Ok(data)
    }

    pub fn open_raw(&self, name: &str) -> VaultResult<Box<dyn Read + Send>> {
        self.store
            .backend
            .open_read(name)?
            .ok_or_else(|| VaultError::BlobNotFound(name.to_string()))
    }

    pub fn raw_len(&self, name: &str) -> VaultResult<u64> {
        self.store
            .backend
            .len(name)?
            .ok_or_else(|| VaultError::BlobNotFound(name.to_string()))
    }

    /// Stage stored bytes verbatim
    pub fn stage_raw(&self, name: &str, data: &[u8]) -> VaultResult<Box<dyn StagedBlob>> {
        self.stage_copy(name, &mut &data[..])
    }

    /// Stage stored bytes verbatim from a stream
    pub fn stage_copy(&self, name: &str, source: &mut dyn Read) -> VaultResult<Box<dyn StagedBlob>> {
        let mut writer = self.store.backend.open_write_atomic(name)?;
        io::copy(source, &mut writer)?;
        writer.finish()
    }
}

/// The key is borrowed only to set up the cipher; streaming runs without it
fn stage_encrypted(
    backend: &dyn BlobBackend,
    name: &str,
    key: KeySource<'_>,
    plaintext: &mut dyn Read,
) -> VaultResult<(Box<dyn StagedBlob>, u64)> {
    let sink = backend.open_write_atomic(name)?;
    let mut writer = key.borrow(|key| Ok(EncryptingWriter::new(key, name.as_bytes(), sink)?))?;
    let written = io::copy(plaintext, &mut writer)?;
    let staged = writer.finish()?.finish()?;
    Ok((staged, written))
}

fn list_names(backend: &dyn BlobBackend) -> VaultResult<Vec<BlobName>> {
    let mut names = Vec::new();
    for raw in backend.list()? {
        match BlobName::parse(&raw) {
            Ok(name) => names.push(name),
            Err(_) => log::debug!("Ignoring foreign file {}", raw),
        }
    }
    names.sort();
    Ok(names)
}

fn detect_blob(backend: &dyn BlobBackend, name: &str) -> VaultResult<Option<BlobFormat>> {
    let Some(len) = backend.len(name)? else {
        return Ok(None);
    };
    let Some(mut raw) = backend.open_read(name)? else {
        return Ok(None);
    };

    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        match raw.read(&mut header[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    let format = match detect_format(&header[..filled]) {
        BlobFormat::Legacy if len < MIN_LEGACY_LEN as u64 => BlobFormat::Unrecognized,
        format => format,
    };
    Ok(Some(format))
}

fn legacy_names(backend: &dyn BlobBackend) -> VaultResult<Vec<BlobName>> {
    let mut legacy = Vec::new();
    for name in list_names(backend)? {
        if detect_blob(backend, &name.to_string())? == Some(BlobFormat::Legacy) {
            legacy.push(name);
        }
    }
    Ok(legacy)
}

// ═══════════════════════════════════════════════════════════════════════════
// SEEKABLE PLAYBACK
// ═══════════════════════════════════════════════════════════════════════════

/// Read + Seek over an encrypted blob.
///
/// Forward seeks decrypt and discard up to the target; backward seeks
/// reopen the blob and discard from the start. Targets past the end are
/// clamped to the plaintext length. Holds the store, not the key: a seek
/// after lock fails with `VaultLocked`.
pub struct SeekableBlob {
    store: Arc<VaultFileStore>,
    name: String,
    len: u64,
    reader: BlobReader,
}

impl SeekableBlob {
    /// Plaintext length
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    fn reopen(&mut self) -> io::Result<()> {
        self.reader = self
            .store
            .open_reader(&self.name)?
            .ok_or_else(|| io::Error::from(VaultError::BlobNotFound(self.name.clone())))?;
        Ok(())
    }
}

impl Read for SeekableBlob {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for SeekableBlob {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.reader.position().checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start of blob"))?
        .min(self.len);

        if target < self.reader.position() {
            log::debug!("Backward seek in {}, reopening", self.name);
            self.reopen()?;
        }

        let distance = target - self.reader.position();
        let skipped = self.reader.skip(distance)?;
        if skipped < distance {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} ended before its recorded length", self.name),
            ));
        }

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::crypto::legacy;
    use crate::storage::MemoryBackend;

    fn store_with(backend: &MemoryBackend) -> Arc<VaultFileStore> {
        let keys = Arc::new(VaultKeyHolder::default());
        keys.install(VaultKey::generate());
        Arc::new(VaultFileStore::open(Arc::new(backend.clone()), keys, "mvb").unwrap())
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_blob_name_roundtrip() {
        let uuid = Uuid::new_v4();
        for role in BlobRole::ALL {
            let name = BlobName::new(uuid, "mvb", role).unwrap();
            let parsed = BlobName::parse(&name.to_string()).unwrap();
            assert_eq!(parsed, name);
        }

        let thumb = BlobName::new(uuid, "mvb", BlobRole::Thumbnail).unwrap();
        assert_eq!(thumb.to_string(), format!("{}.mvb.tn", uuid));
    }

    #[test]
    fn test_blob_name_rejects_garbage() {
        let uuid = Uuid::new_v4();
        for bad in [
            "".to_string(),
            "nope.mvb".to_string(),
            format!("{}", uuid),
            format!("{}.mvb.xx", uuid),
            format!("{}.mvb.tn.tn", uuid),
            format!("{}.m/b", uuid),
            format!("{}.mvb", uuid.to_string().to_uppercase()),
            format!("{}.mvb.{}", uuid, "tmp"),
        ] {
            assert!(BlobName::parse(&bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_write_read_delete() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend);
        let name = store.name_for(Uuid::new_v4(), BlobRole::Primary);

        assert_eq!(store.write(&name, &b"photo"[..]).unwrap(), 5);
        assert_eq!(&store.read_to_vec(&name).unwrap().unwrap()[..], b"photo");
        assert!(store.exists(&name).unwrap());

        // Replace keeps the name
        store.write(&name, &b"edited"[..]).unwrap();
        assert_eq!(&store.read_to_vec(&name).unwrap().unwrap()[..], b"edited");

        store.delete(&name).unwrap();
        store.delete(&name).unwrap();
        assert!(store.read(&name).unwrap().is_none());
    }

    #[test]
    fn test_locked_store_refuses() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend);
        let name = store.name_for(Uuid::new_v4(), BlobRole::Primary);
        store.write(&name, &b"x"[..]).unwrap();

        store.keys().clear();
        assert!(matches!(store.write(&name, &b"y"[..]), Err(VaultError::VaultLocked)));
        assert!(matches!(store.read(&name), Err(VaultError::VaultLocked)));
    }

    #[test]
    fn test_blob_bound_to_its_name() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend);
        let a = store.name_for(Uuid::new_v4(), BlobRole::Primary);
        let b = store.name_for(Uuid::new_v4(), BlobRole::Primary);
        store.write(&a, &b"a"[..]).unwrap();

        // Swap the ciphertext under another name
        backend.put_raw(&b.to_string(), &backend.raw(&a.to_string()).unwrap());
        let err = store.read_to_vec(&b).unwrap_err();
        assert!(err.is_authentication_error());
    }

    #[test]
    fn test_interrupted_write_leaves_old_blob() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend);
        let name = store.name_for(Uuid::new_v4(), BlobRole::Primary);
        store.write(&name, &b"original"[..]).unwrap();

        // Writer that dies half way through
        struct Failing(usize);
        impl Read for Failing {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    return Err(io::Error::new(io::ErrorKind::Other, "source vanished"));
                }
                let n = buf.len().min(self.0);
                buf[..n].fill(0xAB);
                self.0 -= n;
                Ok(n)
            }
        }

        assert!(store.write(&name, Failing(100_000)).is_err());
        assert_eq!(&store.read_to_vec(&name).unwrap().unwrap()[..], b"original");
        assert_eq!(backend.in_flight(), 0);
    }

    #[test]
    fn test_seekable_forward_backward_end() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend);
        let name = store.name_for(Uuid::new_v4(), BlobRole::Primary);
        let plaintext = sample(300_000);
        store.write(&name, &plaintext[..]).unwrap();

        let mut blob = store.open_seekable(&name).unwrap().unwrap();
        assert_eq!(blob.len(), 300_000);

        let mut buf = [0u8; 1000];
        for offset in [150_000u64, 10, 299_000, 0] {
            assert_eq!(blob.seek(SeekFrom::Start(offset)).unwrap(), offset);
            blob.read_exact(&mut buf).unwrap();
            assert_eq!(&buf[..], &plaintext[offset as usize..offset as usize + 1000]);
        }

        assert_eq!(blob.seek(SeekFrom::End(-500)).unwrap(), 299_500);
        assert_eq!(blob.seek(SeekFrom::Current(-100)).unwrap(), 299_400);
        assert_eq!(blob.seek(SeekFrom::End(10)).unwrap(), 300_000);
        assert!(blob.seek(SeekFrom::Current(-400_000)).is_err());

        let mut rest = Vec::new();
        blob.seek(SeekFrom::Start(299_990)).unwrap();
        blob.read_to_end(&mut rest).unwrap();
        assert_eq!(&rest[..], &plaintext[299_990..]);
    }

    #[test]
    fn test_seek_after_lock_fails() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend);
        let name = store.name_for(Uuid::new_v4(), BlobRole::VideoPreview);
        store.write(&name, &sample(5000)[..]).unwrap();

        let mut blob = store.open_seekable(&name).unwrap().unwrap();
        blob.seek(SeekFrom::Start(4000)).unwrap();
        store.keys().clear();

        let err = blob.seek(SeekFrom::Start(0)).unwrap_err();
        assert!(matches!(VaultError::from(err), VaultError::VaultLocked));
    }

    #[test]
    fn test_exclusive_blocks_item_operations() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend);
        let name = store.name_for(Uuid::new_v4(), BlobRole::Primary);

        let access = store.exclusive().unwrap();
        assert!(matches!(store.write(&name, &b"x"[..]), Err(VaultError::Busy)));
        assert!(matches!(store.exclusive(), Err(VaultError::Busy)));
        drop(access);

        store.write(&name, &b"x"[..]).unwrap();
    }

    #[test]
    fn test_listing_and_catalog() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend);
        let known = Uuid::new_v4();
        let orphan = Uuid::new_v4();

        store.write(&store.name_for(known, BlobRole::Primary), &b"p"[..]).unwrap();
        store.write(&store.name_for(known, BlobRole::Thumbnail), &b"t"[..]).unwrap();
        store.write(&store.name_for(orphan, BlobRole::Primary), &b"o"[..]).unwrap();
        backend.put_raw("desktop.ini", b"junk");

        assert_eq!(store.list().unwrap().len(), 3);

        let catalog: MemoryCatalog = [known].into_iter().collect();
        let scoped = store.blobs_for_catalog(&catalog).unwrap();
        assert_eq!(scoped.len(), 2);
        assert!(scoped.iter().all(|n| n.uuid() == known));

        let orphans = store.orphans(&catalog).unwrap();
        assert_eq!(orphans, vec![store.name_for(orphan, BlobRole::Primary)]);
    }

    #[test]
    fn test_legacy_detection() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend);
        let current = store.name_for(Uuid::new_v4(), BlobRole::Primary);
        let old = store.name_for(Uuid::new_v4(), BlobRole::Primary);

        store.write(&current, &b"new"[..]).unwrap();
        backend.put_raw(&old.to_string(), &legacy::seal(&VaultKey::generate(), b"old").unwrap());

        assert_eq!(store.format_of(&current).unwrap(), Some(BlobFormat::Current));
        assert_eq!(store.format_of(&old).unwrap(), Some(BlobFormat::Legacy));
        assert_eq!(store.legacy_blobs().unwrap(), vec![old]);
        assert!(store.needs_migration().unwrap());
    }

    #[test]
    fn test_verify_all_reports_damage() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend);
        let good = store.name_for(Uuid::new_v4(), BlobRole::Primary);
        let bad = store.name_for(Uuid::new_v4(), BlobRole::Primary);
        store.write(&good, &b"fine"[..]).unwrap();
        store.write(&bad, &b"doomed"[..]).unwrap();

        let mut raw = backend.raw(&bad.to_string()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 1;
        backend.put_raw(&bad.to_string(), &raw);

        let report = store.verify_all().unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, bad.to_string());
        assert!(report.failed[0].1.is_authentication_error());
    }
}
