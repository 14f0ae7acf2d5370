//! Media Vault - Legacy Migration
//!
//! Finds blobs still written in the legacy whole-file AES-256-GCM format
//! and rewrites them as current-format streams, with the same
//! stage/commit/rollback discipline as a password change.
//!
//! A blob without the current magic is legacy only if it opens under the
//! legacy key. Anything else is damaged: skipped and reported, never a
//! reason to abort or to keep the vault pending migration.

use crate::blob_store::{ExclusiveAccess, VaultFileStore};
use crate::crypto::{legacy, VaultKey};
use crate::error::VaultResult;
use crate::key_holder::{KeySource, VaultKeyHolder};
use crate::progress::{CancelFlag, ProgressReporter};
use crate::rotation::{read_current, run_rewrite, Rewrite};
use crate::storage::StagedBlob;

/// Result of a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub processed: usize,
    pub total: usize,
    /// Damaged blobs left as they are
    pub skipped: usize,
}

/// Legacy format → current format
struct LegacyUpgrade<'k> {
    legacy_key: &'k VaultKey,
    current_key: KeySource<'k>,
}

impl Rewrite for LegacyUpgrade<'_> {
    fn stage(&self, access: &ExclusiveAccess<'_>, name: &str) -> VaultResult<Box<dyn StagedBlob>> {
        let blob = access.read_raw(name)?;
        let plaintext = legacy::open(self.legacy_key, &blob, name)?;
        access.stage_encrypted(name, self.current_key, &mut &plaintext[..])
    }

    fn restore(&self, access: &ExclusiveAccess<'_>, name: &str) -> VaultResult<Box<dyn StagedBlob>> {
        let plaintext = read_current(access, name, self.current_key)?;
        let blob = legacy::seal(self.legacy_key, &plaintext)?;
        access.stage_raw(name, &blob)
    }
}

/// Rewrites legacy blobs after unlock
pub struct LegacyMigrator<'a> {
    store: &'a VaultFileStore,
    progress: ProgressReporter,
    cancel: CancelFlag,
}

impl<'a> LegacyMigrator<'a> {
    pub fn new(store: &'a VaultFileStore) -> Self {
        Self::with_progress(store, ProgressReporter::detached(), CancelFlag::new())
    }

    pub fn with_progress(
        store: &'a VaultFileStore,
        progress: ProgressReporter,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            store,
            progress,
            cancel,
        }
    }

    /// Any blob whose header is not the current magic. Cheap; damaged
    /// blobs also count until a migration run has looked at them.
    pub fn needs_migration(&self) -> VaultResult<bool> {
        self.store.needs_migration()
    }

    /// Rewrite every legacy blob. Running again with nothing left to do
    /// processes zero blobs.
    pub fn migrate(&self, legacy_key: &VaultKey, current_key: &VaultKey) -> VaultResult<MigrationReport> {
        self.migrate_into(legacy_key, KeySource::Key(current_key))
    }

    /// [`migrate`](Self::migrate) into the session key, borrowed per blob
    /// so the vault can be locked while the run is in progress
    pub fn migrate_to_session(
        &self,
        legacy_key: &VaultKey,
        keys: &VaultKeyHolder,
    ) -> VaultResult<MigrationReport> {
        keys.with_key(|_| Ok(()))?;
        self.migrate_into(legacy_key, KeySource::Session(keys))
    }

    fn migrate_into(&self, legacy_key: &VaultKey, current_key: KeySource<'_>) -> VaultResult<MigrationReport> {
        let access = self.store.exclusive()?;
        let scan = access.scan_legacy(legacy_key)?;
        let skipped = scan.unreadable.len();
        let names: Vec<String> = scan.legacy.iter().map(|n| n.to_string()).collect();

        if names.is_empty() {
            log::debug!("No legacy blobs to migrate");
            return Ok(MigrationReport {
                processed: 0,
                total: 0,
                skipped,
            });
        }

        log::info!("Migrating {} legacy blob(s)", names.len());
        let job = LegacyUpgrade {
            legacy_key,
            current_key,
        };

        let processed = run_rewrite(&access, &names, &job, &self.progress, &self.cancel)
            .map_err(|e| {
                log::warn!("Legacy migration rolled back: {}", e);
                e
            })?;

        log::info!("Legacy migration complete: {} blob(s)", processed);
        Ok(MigrationReport {
            processed,
            total: names.len(),
            skipped,
        })
    }
}
