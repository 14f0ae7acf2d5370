//! Media Vault - Backup and Restore
//!
//! Archive format:
//! ```text
//! [MAGIC 8B]["MVBACKUP"]
//! [VERSION u32 LE]
//! [MANIFEST bincode]{ entry_count u64, created_at i64 }
//! entry_count × ([ENTRY bincode]{ name, length u64 } [length bytes])
//! [SHA-256 32B][over everything above]
//! ```
//!
//! Entries are blobs exactly as stored: still encrypted, still bound to
//! their names. The archive is only as portable as the password.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use bincode::Options;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::blob_store::{BlobName, ExclusiveAccess, VaultFileStore};
use crate::crypto::{DecryptingReader, VaultKey};
use crate::error::{VaultError, VaultResult};
use crate::storage::{write_atomic_with, StagedBlob};

/// Archive magic
pub const BACKUP_MAGIC: &[u8; 8] = b"MVBACKUP";

/// Newest archive version this build reads and the one it writes
pub const BACKUP_VERSION: u32 = 1;

const CHECKSUM_LEN: usize = 32;

/// Upper bound of a single bincode record
const RECORD_LIMIT: u64 = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct ManifestBody {
    entry_count: u64,
    created_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    name: String,
    length: u64,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(RECORD_LIMIT)
}

/// Archive header as read by [`BackupPackager::inspect`]
#[derive(Debug, Clone)]
pub struct BackupManifest {
    pub version: u32,
    pub entry_count: u64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Import policy
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions<'k> {
    /// Replace blobs that already exist
    pub overwrite: bool,
    /// Reject entries that do not authenticate under this key
    pub verify_key: Option<&'k VaultKey>,
}

/// Outcome of an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeResult {
    pub imported: usize,
    pub skipped: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Import,
    Skip,
    Reject,
}

// ═══════════════════════════════════════════════════════════════════════════
// HASHING STREAMS
// ═══════════════════════════════════════════════════════════════════════════

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, [u8; CHECKSUM_LEN]) {
        (self.inner, self.hasher.finalize().into())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct HashingReader<R: Read> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Compare the trailer against everything read so far and require EOF
    fn check_trailer(mut self) -> VaultResult<()> {
        let computed: [u8; CHECKSUM_LEN] = self.hasher.finalize().into();

        let mut trailer = [0u8; CHECKSUM_LEN];
        read_exact_or_corrupt(&mut self.inner, &mut trailer, "checksum")?;
        if computed != trailer {
            return Err(VaultError::CorruptBackup("checksum mismatch".into()));
        }

        let mut extra = [0u8; 1];
        if self.inner.read(&mut extra)? != 0 {
            return Err(VaultError::CorruptBackup("data after checksum".into()));
        }
        Ok(())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn read_exact_or_corrupt<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8], what: &str) -> VaultResult<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            VaultError::CorruptBackup(format!("archive ends inside {}", what))
        } else {
            VaultError::Io(e)
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// ARCHIVE PARSING
// ═══════════════════════════════════════════════════════════════════════════

/// Magic, version and manifest. Unknown versions fail closed.
fn read_preamble<R: Read>(reader: &mut R) -> VaultResult<ManifestBody> {
    let mut magic = [0u8; 8];
    read_exact_or_corrupt(reader, &mut magic, "header")?;
    if &magic != BACKUP_MAGIC {
        return Err(VaultError::CorruptBackup("not a media vault backup".into()));
    }

    let mut version = [0u8; 4];
    read_exact_or_corrupt(reader, &mut version, "header")?;
    let version = u32::from_le_bytes(version);
    if version != BACKUP_VERSION {
        return Err(VaultError::UnsupportedBackupVersion {
            found: version,
            supported: BACKUP_VERSION,
        });
    }

    Ok(codec().deserialize_from(reader)?)
}

fn read_entry_header<R: Read>(reader: &mut R) -> VaultResult<(String, u64)> {
    let header: EntryHeader = codec().deserialize_from(reader)?;
    BlobName::parse(&header.name)
        .map_err(|_| VaultError::CorruptBackup(format!("invalid entry name {:?}", header.name)))?;
    Ok((header.name, header.length))
}

/// Consume the rest of an entry body; a short body means a truncated archive
fn drain_entry<R: Read>(body: &mut io::Take<R>, name: &str) -> VaultResult<()> {
    io::copy(body, &mut io::sink())?;
    if body.limit() != 0 {
        return Err(VaultError::CorruptBackup(format!("entry {} is truncated", name)));
    }
    Ok(())
}

/// Whether an entry body authenticates under `key` as the blob `name`
fn authenticates(key: &VaultKey, name: &str, body: &mut dyn Read) -> VaultResult<bool> {
    let rejected = |e: &VaultError| e.is_authentication_error() || e.is_integrity_error();

    let mut reader = match DecryptingReader::new(key, name, body) {
        Ok(reader) => reader,
        Err(e) if rejected(&e) => return Ok(false),
        Err(e) => return Err(e),
    };

    match io::copy(&mut reader, &mut io::sink()) {
        Ok(_) => Ok(true),
        Err(e) => {
            let e = VaultError::from(e);
            if rejected(&e) {
                Ok(false)
            } else {
                Err(e)
            }
        }
    }
}

fn open_archive(source: &Path) -> VaultResult<HashingReader<BufReader<File>>> {
    let file = File::open(source)?;
    Ok(HashingReader::new(BufReader::new(file)))
}

// ═══════════════════════════════════════════════════════════════════════════
// PACKAGER
// ═══════════════════════════════════════════════════════════════════════════

/// Exports and imports whole-vault archives
pub struct BackupPackager<'a> {
    store: &'a VaultFileStore,
}

impl<'a> BackupPackager<'a> {
    pub fn new(store: &'a VaultFileStore) -> Self {
        Self { store }
    }

    /// Write every blob into an archive at `destination`, atomically.
    /// Returns the number of entries. Blobs are copied as stored, legacy
    /// and damaged ones included.
    pub fn export(&self, destination: &Path) -> VaultResult<usize> {
        let access = self.store.exclusive()?;
        let names: Vec<String> = access.list()?.iter().map(|n| n.to_string()).collect();

        write_atomic_with(destination, |out| {
            let mut writer = HashingWriter::new(out);
            writer.write_all(BACKUP_MAGIC)?;
            writer.write_all(&BACKUP_VERSION.to_le_bytes())?;
            codec().serialize_into(
                &mut writer,
                &ManifestBody {
                    entry_count: names.len() as u64,
                    created_at: Utc::now().timestamp(),
                },
            )?;

            for name in &names {
                let length = access.raw_len(name)?;
                codec().serialize_into(
                    &mut writer,
                    &EntryHeader {
                        name: name.clone(),
                        length,
                    },
                )?;

                let copied = io::copy(&mut access.open_raw(name)?.take(length), &mut writer)?;
                if copied != length {
                    return Err(VaultError::CorruptBackup(format!(
                        "{} changed size during export",
                        name
                    )));
                }
            }

            let (out, checksum) = writer.finish();
            out.write_all(&checksum)?;
            Ok(())
        })?;

        log::info!("Exported {} blob(s) to {}", names.len(), destination.display());
        Ok(names.len())
    }

    /// Read only the archive header
    pub fn inspect(source: &Path) -> VaultResult<BackupManifest> {
        let mut reader = open_archive(source)?;
        let manifest = read_preamble(&mut reader)?;
        Ok(BackupManifest {
            version: BACKUP_VERSION,
            entry_count: manifest.entry_count,
            created_at: Utc.timestamp_opt(manifest.created_at, 0).single(),
        })
    }

    /// Merge an archive into the vault.
    ///
    /// The first pass validates the whole archive and writes nothing; a
    /// malformed, truncated or future-version archive leaves the vault
    /// untouched. The second pass stages accepted entries and commits them
    /// once the checksum has matched again.
    pub fn import(&self, source: &Path, options: ImportOptions<'_>) -> VaultResult<MergeResult> {
        let access = self.store.exclusive()?;

        let plan = self.validate(&access, source, &options)?;
        let mut result = MergeResult::default();
        for (name, disposition) in &plan {
            match disposition {
                Disposition::Import => result.imported += 1,
                Disposition::Skip => result.skipped += 1,
                Disposition::Reject => {
                    log::warn!("Rejected backup entry {}: does not authenticate", name);
                    result.rejected += 1;
                }
            }
        }

        let staged = self.stage(&access, source, &plan)?;
        for blob in staged {
            blob.commit()?;
        }

        log::info!(
            "Imported backup {}: {} imported, {} skipped, {} rejected",
            source.display(),
            result.imported,
            result.skipped,
            result.rejected
        );
        Ok(result)
    }

    fn validate(
        &self,
        access: &ExclusiveAccess<'_>,
        source: &Path,
        options: &ImportOptions<'_>,
    ) -> VaultResult<Vec<(String, Disposition)>> {
        let mut reader = open_archive(source)?;
        let manifest = read_preamble(&mut reader)?;

        let mut seen = HashSet::new();
        let mut plan = Vec::new();

        for _ in 0..manifest.entry_count {
            let (name, length) = read_entry_header(&mut reader)?;
            if !seen.insert(name.clone()) {
                return Err(VaultError::CorruptBackup(format!("duplicate entry {}", name)));
            }

            let mut body = (&mut reader).take(length);
            let disposition = if access.exists(&name)? && !options.overwrite {
                Disposition::Skip
            } else if let Some(key) = options.verify_key {
                if authenticates(key, &name, &mut body)? {
                    Disposition::Import
                } else {
                    Disposition::Reject
                }
            } else {
                Disposition::Import
            };
            drain_entry(&mut body, &name)?;

            plan.push((name, disposition));
        }

        reader.check_trailer()?;
        Ok(plan)
    }

    fn stage(
        &self,
        access: &ExclusiveAccess<'_>,
        source: &Path,
        plan: &[(String, Disposition)],
    ) -> VaultResult<Vec<Box<dyn StagedBlob>>> {
        let mut reader = open_archive(source)?;
        let manifest = read_preamble(&mut reader)?;
        if manifest.entry_count != plan.len() as u64 {
            return Err(VaultError::CorruptBackup("archive changed during import".into()));
        }

        let mut staged = Vec::new();
        for (expected, disposition) in plan {
            let (name, length) = read_entry_header(&mut reader)?;
            if &name != expected {
                return Err(VaultError::CorruptBackup("archive changed during import".into()));
            }

            let mut body = (&mut reader).take(length);
            if *disposition == Disposition::Import {
                staged.push(access.stage_copy(&name, &mut body)?);
            }
            drain_entry(&mut body, &name)?;
        }

        reader.check_trailer()?;
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::BlobRole;
    use crate::crypto::legacy;
    use crate::key_holder::VaultKeyHolder;
    use crate::storage::{BlobBackend, MemoryBackend};
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn vault_store(key: &VaultKey) -> (MemoryBackend, Arc<VaultFileStore>) {
        let backend = MemoryBackend::new();
        let keys = Arc::new(VaultKeyHolder::default());
        keys.install(VaultKey::new(*key.expose()));
        let store = Arc::new(VaultFileStore::open(Arc::new(backend.clone()), keys, "mvb").unwrap());
        (backend, store)
    }

    fn populated(key: &VaultKey, count: usize) -> (MemoryBackend, Arc<VaultFileStore>, Vec<BlobName>) {
        let (backend, store) = vault_store(key);
        let names = (0..count)
            .map(|i| {
                let name = store.name_for(Uuid::new_v4(), BlobRole::Primary);
                store.write(&name, format!("media {}", i).as_bytes()).unwrap();
                name
            })
            .collect();
        (backend, store, names)
    }

    #[test]
    fn test_export_import_roundtrip() {
        let key = VaultKey::generate();
        let (_, source, names) = populated(&key, 4);
        let dir = tempdir().unwrap();
        let archive = dir.path().join("vault.mvbackup");

        assert_eq!(BackupPackager::new(&source).export(&archive).unwrap(), 4);
        assert_eq!(BackupPackager::inspect(&archive).unwrap().entry_count, 4);

        let (_, target) = vault_store(&key);
        let result = BackupPackager::new(&target)
            .import(&archive, ImportOptions::default())
            .unwrap();
        assert_eq!(result, MergeResult { imported: 4, skipped: 0, rejected: 0 });

        for name in &names {
            assert_eq!(
                target.read_to_vec(name).unwrap().unwrap(),
                source.read_to_vec(name).unwrap().unwrap()
            );
        }
    }

    #[test]
    fn test_future_version_rejected() {
        let key = VaultKey::generate();
        let (_, source, _) = populated(&key, 2);
        let dir = tempdir().unwrap();
        let archive = dir.path().join("vault.mvbackup");
        BackupPackager::new(&source).export(&archive).unwrap();

        let mut bytes = std::fs::read(&archive).unwrap();
        bytes[8..12].copy_from_slice(&(BACKUP_VERSION + 1).to_le_bytes());
        std::fs::write(&archive, &bytes).unwrap();

        let (backend, target) = vault_store(&key);
        let err = BackupPackager::new(&target)
            .import(&archive, ImportOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::UnsupportedBackupVersion { found, supported } if found == BACKUP_VERSION + 1 && supported == BACKUP_VERSION
        ));
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_or_truncated_archive_writes_nothing() {
        let key = VaultKey::generate();
        let (_, source, _) = populated(&key, 3);
        let dir = tempdir().unwrap();
        let archive = dir.path().join("vault.mvbackup");
        BackupPackager::new(&source).export(&archive).unwrap();
        let bytes = std::fs::read(&archive).unwrap();

        let mut flipped = bytes.clone();
        let middle = flipped.len() / 2;
        flipped[middle] ^= 0x01;

        let cases = [
            flipped,
            bytes[..bytes.len() - 10].to_vec(),
            bytes[..bytes.len() / 3].to_vec(),
            b"NOTABACKUP".to_vec(),
        ];

        for case in cases {
            std::fs::write(&archive, &case).unwrap();
            let (backend, target) = vault_store(&key);
            let err = BackupPackager::new(&target)
                .import(&archive, ImportOptions::default())
                .unwrap_err();
            assert!(err.is_integrity_error(), "unexpected error {:?}", err);
            assert!(backend.list().unwrap().is_empty());
            assert_eq!(backend.in_flight(), 0);
        }
    }

    #[test]
    fn test_conflicts_skipped_unless_overwrite() {
        let key = VaultKey::generate();
        let (_, source, names) = populated(&key, 2);
        let dir = tempdir().unwrap();
        let archive = dir.path().join("vault.mvbackup");
        BackupPackager::new(&source).export(&archive).unwrap();

        let (_, target) = vault_store(&key);
        target.write(&names[0], &b"local edit"[..]).unwrap();

        let packager = BackupPackager::new(&target);
        let result = packager.import(&archive, ImportOptions::default()).unwrap();
        assert_eq!(result, MergeResult { imported: 1, skipped: 1, rejected: 0 });
        assert_eq!(&target.read_to_vec(&names[0]).unwrap().unwrap()[..], b"local edit");

        let options = ImportOptions {
            overwrite: true,
            ..Default::default()
        };
        let result = packager.import(&archive, options).unwrap();
        assert_eq!(result.imported, 2);
        assert_eq!(&target.read_to_vec(&names[0]).unwrap().unwrap()[..], b"media 0");
    }

    #[test]
    fn test_verify_key_rejects_foreign_entries() {
        let key = VaultKey::generate();
        let (_, source, _) = populated(&key, 3);
        let dir = tempdir().unwrap();
        let archive = dir.path().join("vault.mvbackup");
        BackupPackager::new(&source).export(&archive).unwrap();

        // Target vault under a different password
        let other = VaultKey::generate();
        let (backend, target) = vault_store(&other);
        let options = ImportOptions {
            overwrite: false,
            verify_key: Some(&other),
        };
        let result = BackupPackager::new(&target).import(&archive, options).unwrap();
        assert_eq!(result, MergeResult { imported: 0, skipped: 0, rejected: 3 });
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn test_export_copies_legacy_and_damaged_blobs_verbatim() {
        let key = VaultKey::generate();
        let (backend, store, names) = populated(&key, 2);

        let old = store.name_for(Uuid::new_v4(), BlobRole::Primary).to_string();
        backend.put_raw(&old, &legacy::seal(&key, b"old").unwrap());
        let damaged = names[1].to_string();
        let mut raw = backend.raw(&damaged).unwrap();
        raw[0] ^= 0x01;
        backend.put_raw(&damaged, &raw);

        let dir = tempdir().unwrap();
        let archive = dir.path().join("vault.mvbackup");
        assert_eq!(BackupPackager::new(&store).export(&archive).unwrap(), 3);

        let (target_backend, target) = vault_store(&key);
        let result = BackupPackager::new(&target)
            .import(&archive, ImportOptions::default())
            .unwrap();
        assert_eq!(result.imported, 3);
        assert_eq!(target_backend.raw(&old), backend.raw(&old));
        assert_eq!(target_backend.raw(&damaged).unwrap(), raw);
        assert_eq!(&target.read_to_vec(&names[0]).unwrap().unwrap()[..], b"media 0");
    }
}
