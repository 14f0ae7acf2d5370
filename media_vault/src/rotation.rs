//! Media Vault - Re-encryption on Password Change
//!
//! Rewrites every blob from the old key to the new key, all or nothing.
//!
//! ```text
//! Idle → Running ─┬─→ Completed
//!                 └─→ RolledBack
//! ```
//!
//! Phase 1 stages a replacement for every blob. A blob is staged only
//! after its old tag verified. Any failure or cancel drops the staged temps
//! and nothing visible changed.
//!
//! Phase 2 renames the staged blobs into place. Cancellation is ignored.
//! If a rename fails, every blob already renamed is rewritten back under the
//! old key before the error is returned.
//!
//! A password change holds one [`ExclusiveAccess`] across the rewrite, the
//! credential save and the key install, and runs through
//! [`ReEncryptionCoordinator::run_locked`].

use std::io::Read;

use zeroize::Zeroizing;

use crate::blob_store::{ExclusiveAccess, VaultFileStore};
use crate::crypto::VaultKey;
use crate::key_holder::KeySource;
use crate::error::{VaultError, VaultResult};
use crate::progress::{CancelFlag, ProgressReporter};
use crate::storage::StagedBlob;

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyState {
    Idle,
    Running,
    Completed,
    RolledBack,
}

/// Result of a completed rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyReport {
    pub processed: usize,
    pub total: usize,
}

/// How one blob is rewritten, and how a committed rewrite is undone
pub(crate) trait Rewrite {
    fn stage(&self, access: &ExclusiveAccess<'_>, name: &str) -> VaultResult<Box<dyn StagedBlob>>;

    fn restore(&self, access: &ExclusiveAccess<'_>, name: &str) -> VaultResult<Box<dyn StagedBlob>>;
}

/// Current format under one key → current format under another
struct KeyChange<'k> {
    old: &'k VaultKey,
    new: &'k VaultKey,
}

impl Rewrite for KeyChange<'_> {
    fn stage(&self, access: &ExclusiveAccess<'_>, name: &str) -> VaultResult<Box<dyn StagedBlob>> {
        // Copy runs to end of stream, so the old tag is checked before staging
        let mut reader = access.open_decrypting(name, self.old)?;
        access.stage_encrypted(name, self.new, &mut reader)
    }

    fn restore(&self, access: &ExclusiveAccess<'_>, name: &str) -> VaultResult<Box<dyn StagedBlob>> {
        let mut reader = access.open_decrypting(name, self.new)?;
        access.stage_encrypted(name, self.old, &mut reader)
    }
}

/// Drives a whole-vault key change
pub struct ReEncryptionCoordinator<'a> {
    store: &'a VaultFileStore,
    legacy_key: Option<&'a VaultKey>,
    state: RekeyState,
    progress: ProgressReporter,
    cancel: CancelFlag,
}

impl<'a> ReEncryptionCoordinator<'a> {
    pub fn new(store: &'a VaultFileStore, progress: ProgressReporter, cancel: CancelFlag) -> Self {
        Self {
            store,
            legacy_key: None,
            state: RekeyState::Idle,
            progress,
            cancel,
        }
    }

    pub fn state(&self) -> RekeyState {
        self.state
    }

    /// Tell legacy blobs from damaged ones with this key. Without it every
    /// blob lacking the current magic counts as pending migration.
    pub fn with_legacy_key(mut self, legacy_key: &'a VaultKey) -> Self {
        self.legacy_key = Some(legacy_key);
        self
    }

    /// Rewrite every blob in the store from `old_key` to `new_key`.
    ///
    /// Refuses with `MigrationPending` while legacy blobs remain, since
    /// those cannot be read under `old_key`.
    pub fn run(&mut self, old_key: &VaultKey, new_key: &VaultKey) -> VaultResult<RekeyReport> {
        let access = self.store.exclusive()?;
        self.run_locked(&access, old_key, new_key)
    }

    /// [`run`](Self::run) under an exclusive lock the caller already holds
    /// and keeps holding afterwards
    pub fn run_locked(
        &mut self,
        access: &ExclusiveAccess<'_>,
        old_key: &VaultKey,
        new_key: &VaultKey,
    ) -> VaultResult<RekeyReport> {
        let names: Vec<String> = match self.legacy_key {
            Some(legacy_key) => {
                let scan = access.scan_legacy(legacy_key)?;
                if !scan.legacy.is_empty() {
                    return Err(VaultError::MigrationPending(scan.legacy.len()));
                }
                for (name, e) in &scan.unreadable {
                    log::warn!("Leaving damaged blob {} as is: {}", name, e);
                }
                access.current_blobs()?.iter().map(|n| n.to_string()).collect()
            }
            None => {
                let legacy = access.legacy_blobs()?;
                if !legacy.is_empty() {
                    return Err(VaultError::MigrationPending(legacy.len()));
                }
                access.current_blobs()?.iter().map(|n| n.to_string()).collect()
            }
        };
        log::info!("Re-encrypting {} blob(s)", names.len());

        self.state = RekeyState::Running;
        let job = KeyChange {
            old: old_key,
            new: new_key,
        };

        match run_rewrite(access, &names, &job, &self.progress, &self.cancel) {
            Ok(processed) => {
                self.state = RekeyState::Completed;
                log::info!("Re-encryption complete: {} blob(s)", processed);
                Ok(RekeyReport {
                    processed,
                    total: names.len(),
                })
            }
            Err(e) => {
                self.state = RekeyState::RolledBack;
                if e.is_security_critical() {
                    log::error!("Re-encryption rollback incomplete: {}", e);
                } else {
                    log::warn!("Re-encryption rolled back: {}", e);
                }
                Err(e)
            }
        }
    }
}

/// Stage every blob, then commit every blob; undo committed ones on failure.
/// Returns the number of blobs rewritten.
pub(crate) fn run_rewrite(
    access: &ExclusiveAccess<'_>,
    names: &[String],
    job: &dyn Rewrite,
    progress: &ProgressReporter,
    cancel: &CancelFlag,
) -> VaultResult<usize> {
    let total = names.len();
    progress.start(total);

    // Phase 1: stage. Dropping `staged` on any early return removes the temps.
    let mut staged: Vec<Box<dyn StagedBlob>> = Vec::with_capacity(total);
    for (i, name) in names.iter().enumerate() {
        if cancel.is_cancelled() {
            progress.fail(VaultError::Cancelled);
            return Err(VaultError::Cancelled);
        }

        match job.stage(access, name) {
            Ok(blob) => staged.push(blob),
            Err(e) => {
                progress.fail(&e);
                return Err(VaultError::RewriteAborted {
                    blob: name.clone(),
                    source: Box::new(e),
                });
            }
        }
        progress.advance(i + 1);
    }

    if cancel.is_cancelled() {
        progress.fail(VaultError::Cancelled);
        return Err(VaultError::Cancelled);
    }

    // Phase 2: commit
    let mut committed: Vec<String> = Vec::with_capacity(total);
    let mut pending = staged.into_iter();
    while let Some(blob) = pending.next() {
        let name = blob.name().to_string();

        if let Err(e) = blob.commit() {
            drop(pending);
            progress.fail(&e);
            log::warn!(
                "Commit of {} failed, restoring {} committed blob(s)",
                name,
                committed.len()
            );

            let unrestored = roll_back(access, &committed, job);
            if unrestored.is_empty() {
                return Err(VaultError::RewriteAborted {
                    blob: name,
                    source: Box::new(e),
                });
            }
            return Err(VaultError::RollbackIncomplete {
                blobs: unrestored,
                cause: e.to_string(),
            });
        }

        committed.push(name);
    }

    Ok(committed.len())
}

/// Undo committed rewrites. Runs over every blob regardless of failures and
/// returns the ones it could not restore.
fn roll_back(access: &ExclusiveAccess<'_>, committed: &[String], job: &dyn Rewrite) -> Vec<String> {
    let mut unrestored = Vec::new();

    for name in committed {
        let restored = job.restore(access, name).and_then(|blob| blob.commit());
        if let Err(e) = restored {
            log::error!("Could not restore {}: {}", name, e);
            unrestored.push(name.clone());
        }
    }

    unrestored
}

/// Read a current-format blob fully under `key`
pub(crate) fn read_current<'k>(
    access: &ExclusiveAccess<'_>,
    name: &str,
    key: impl Into<KeySource<'k>>,
) -> VaultResult<Zeroizing<Vec<u8>>> {
    let mut reader = access.open_decrypting(name, key)?;
    let mut plaintext = Zeroizing::new(Vec::new());
    reader.read_to_end(&mut plaintext)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobName, BlobRole};
    use crate::key_holder::VaultKeyHolder;
    use crate::storage::MemoryBackend;
    use std::sync::Arc;
    use uuid::Uuid;

    struct Fixture {
        backend: MemoryBackend,
        store: Arc<VaultFileStore>,
        names: Vec<BlobName>,
        old: VaultKey,
    }

    fn fixture(count: usize) -> Fixture {
        let backend = MemoryBackend::new();
        let keys = Arc::new(VaultKeyHolder::default());
        let old = VaultKey::generate();
        keys.install(VaultKey::new(*old.expose()));

        let store = Arc::new(VaultFileStore::open(Arc::new(backend.clone()), keys, "mvb").unwrap());
        let names: Vec<BlobName> = (0..count)
            .map(|i| {
                let name = store.name_for(Uuid::new_v4(), BlobRole::Primary);
                store.write(&name, format!("item {}", i).as_bytes()).unwrap();
                name
            })
            .collect();

        Fixture {
            backend,
            store,
            names,
            old,
        }
    }

    fn snapshot(f: &Fixture) -> Vec<Vec<u8>> {
        f.names
            .iter()
            .map(|n| f.backend.raw(&n.to_string()).unwrap())
            .collect()
    }

    fn read_with(f: &Fixture, name: &BlobName, key: &VaultKey) -> VaultResult<Vec<u8>> {
        let access = f.store.exclusive()?;
        Ok(read_current(&access, &name.to_string(), key)?.to_vec())
    }

    #[test]
    fn test_rekey_success() {
        let f = fixture(5);
        let new = VaultKey::generate();
        let (reporter, watch) = ProgressReporter::channel();

        let mut coordinator = ReEncryptionCoordinator::new(&f.store, reporter, CancelFlag::new());
        assert_eq!(coordinator.state(), RekeyState::Idle);

        let report = coordinator.run(&f.old, &new).unwrap();
        assert_eq!(report, RekeyReport { processed: 5, total: 5 });
        assert_eq!(coordinator.state(), RekeyState::Completed);
        assert_eq!(watch.snapshot().processed, 5);

        for (i, name) in f.names.iter().enumerate() {
            assert_eq!(read_with(&f, name, &new).unwrap(), format!("item {}", i).into_bytes());
            assert!(read_with(&f, name, &f.old).unwrap_err().is_authentication_error());
        }
        assert_eq!(f.backend.in_flight(), 0);
    }

    #[test]
    fn test_staging_failure_changes_nothing() {
        let f = fixture(4);
        let victim = f.names[2].to_string();
        let mut raw = f.backend.raw(&victim).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x55;
        f.backend.put_raw(&victim, &raw);
        let before = snapshot(&f);

        let mut coordinator =
            ReEncryptionCoordinator::new(&f.store, ProgressReporter::detached(), CancelFlag::new());
        let err = coordinator.run(&f.old, &VaultKey::generate()).unwrap_err();

        assert!(matches!(err, VaultError::RewriteAborted { ref blob, .. } if *blob == victim));
        assert_eq!(coordinator.state(), RekeyState::RolledBack);
        assert_eq!(snapshot(&f), before);
        assert_eq!(f.backend.in_flight(), 0);
    }

    #[test]
    fn test_commit_failure_rolls_back() {
        let f = fixture(5);
        let before: Vec<Vec<u8>> = f
            .names
            .iter()
            .map(|n| read_with(&f, n, &f.old).unwrap())
            .collect();

        // Names are committed in listing order; fail the fourth
        let mut order: Vec<String> = f.names.iter().map(|n| n.to_string()).collect();
        order.sort();
        f.backend.fail_commit_of(&order[3]);

        let (reporter, watch) = ProgressReporter::channel();
        let mut coordinator = ReEncryptionCoordinator::new(&f.store, reporter, CancelFlag::new());
        let new = VaultKey::generate();
        let err = coordinator.run(&f.old, &new).unwrap_err();

        assert!(matches!(err, VaultError::RewriteAborted { .. }));
        assert_eq!(coordinator.state(), RekeyState::RolledBack);
        assert!(watch.snapshot().last_error.is_some());

        // Every blob readable under the old key with its original content
        for (name, expected) in f.names.iter().zip(before) {
            assert_eq!(read_with(&f, name, &f.old).unwrap(), expected);
            assert!(read_with(&f, name, &new).is_err());
        }
        assert_eq!(f.backend.in_flight(), 0);
    }

    #[test]
    fn test_cancel_before_commit_changes_nothing() {
        let f = fixture(3);
        let before = snapshot(&f);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let mut coordinator =
            ReEncryptionCoordinator::new(&f.store, ProgressReporter::detached(), cancel);
        let err = coordinator.run(&f.old, &VaultKey::generate()).unwrap_err();

        assert!(matches!(err, VaultError::Cancelled));
        assert_eq!(snapshot(&f), before);
    }

    #[test]
    fn test_busy_while_exclusive_held() {
        let f = fixture(1);
        let _held = f.store.exclusive().unwrap();

        let mut coordinator =
            ReEncryptionCoordinator::new(&f.store, ProgressReporter::detached(), CancelFlag::new());
        assert!(matches!(
            coordinator.run(&f.old, &VaultKey::generate()),
            Err(VaultError::Busy)
        ));
        assert_eq!(coordinator.state(), RekeyState::Idle);
    }

    #[test]
    fn test_run_locked_keeps_namespace_exclusive() {
        let f = fixture(2);
        let new = VaultKey::generate();
        let access = f.store.exclusive().unwrap();

        let mut coordinator =
            ReEncryptionCoordinator::new(&f.store, ProgressReporter::detached(), CancelFlag::new());
        coordinator.run_locked(&access, &f.old, &new).unwrap();

        // Item writes stay out until the caller lets go
        let late = f.store.name_for(Uuid::new_v4(), BlobRole::Primary);
        assert!(matches!(f.store.write(&late, &b"late"[..]), Err(VaultError::Busy)));
        drop(access);
        f.store.write(&late, &b"late"[..]).unwrap();
    }

    #[test]
    fn test_damaged_header_not_counted_as_legacy() {
        let f = fixture(3);
        let victim = f.names[1].to_string();
        let mut raw = f.backend.raw(&victim).unwrap();
        raw[0] ^= 0x01;
        f.backend.put_raw(&victim, &raw);

        let legacy_key = VaultKey::generate();
        let new = VaultKey::generate();

        let mut keyless =
            ReEncryptionCoordinator::new(&f.store, ProgressReporter::detached(), CancelFlag::new());
        assert!(matches!(
            keyless.run(&f.old, &new),
            Err(VaultError::MigrationPending(1))
        ));

        let mut coordinator =
            ReEncryptionCoordinator::new(&f.store, ProgressReporter::detached(), CancelFlag::new())
                .with_legacy_key(&legacy_key);
        let report = coordinator.run(&f.old, &new).unwrap();

        assert_eq!(report, RekeyReport { processed: 2, total: 2 });
        assert_eq!(f.backend.raw(&victim).unwrap(), raw);
        assert_eq!(read_with(&f, &f.names[0], &new).unwrap(), b"item 0".to_vec());
        assert_eq!(read_with(&f, &f.names[2], &new).unwrap(), b"item 2".to_vec());
    }

    #[test]
    fn test_empty_vault_completes() {
        let f = fixture(0);
        let mut coordinator =
            ReEncryptionCoordinator::new(&f.store, ProgressReporter::detached(), CancelFlag::new());
        let report = coordinator.run(&f.old, &VaultKey::generate()).unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(coordinator.state(), RekeyState::Completed);
    }
}
