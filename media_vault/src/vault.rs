//! Media Vault - Session Facade
//!
//! Ties the credential, the session key, the blob store and the vault-wide
//! jobs together. Layout on disk:
//!
//! ```text
//! <root>/config.json       VaultConfig (optional)
//! <root>/credential.json   password hash + key salt
//! <root>/blobs/            encrypted blobs
//! ```

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;
use zeroize::Zeroizing;

use crate::backup::{BackupPackager, ImportOptions, MergeResult};
use crate::blob_store::{BlobName, BlobReader, BlobRole, SeekableBlob, VaultFileStore, VerifyReport};
use crate::catalog::Catalog;
use crate::config::VaultConfig;
use crate::crypto::{Credential, CredentialStore, KeyDeriver, PasswordVerifier, VaultKey};
use crate::error::{VaultError, VaultResult};
use crate::key_holder::VaultKeyHolder;
use crate::migration::{LegacyMigrator, MigrationReport};
use crate::progress::{CancelFlag, ProgressReporter};
use crate::rotation::ReEncryptionCoordinator;
use crate::storage::{BlobBackend, FsBackend};

/// Blob directory inside the vault root
pub const BLOBS_DIR: &str = "blobs";

/// Vault state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    Locked,
    Unlocked,
}

/// Outcome of [`MediaVault::unlock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// Key installed; `migrated` legacy blobs were rewritten on the way
    Unlocked { migrated: usize },
    WrongPassword,
    /// No usable credential record
    VaultUninitialized,
}

/// Outcome of [`MediaVault::change_password`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordChange {
    Completed { rewritten: usize },
    WrongOldPassword,
    /// Password not changed, vault unchanged
    Failed(String),
}

/// Media Vault - Main entry point
pub struct MediaVault {
    root: PathBuf,
    config: VaultConfig,
    verifier: PasswordVerifier,
    keys: Arc<VaultKeyHolder>,
    store: Arc<VaultFileStore>,
    catalog: Option<Arc<dyn Catalog>>,
}

impl MediaVault {
    // ═══════════════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a new vault at the given path and leave it unlocked
    pub fn create<P: AsRef<Path>>(path: P, password: &str) -> VaultResult<Self> {
        Self::create_with_config(path, password, VaultConfig::default())
    }

    pub fn create_with_config<P: AsRef<Path>>(
        path: P,
        password: &str,
        config: VaultConfig,
    ) -> VaultResult<Self> {
        let root = path.as_ref().to_path_buf();
        if CredentialStore::new(&root).exists() {
            return Err(VaultError::VaultAlreadyInitialized(root.display().to_string()));
        }

        std::fs::create_dir_all(&root)?;
        config.save(&root)?;

        let backend = FsBackend::new(&root.join(BLOBS_DIR))?;
        let vault = Self::with_backend(&root, config, Arc::new(backend))?;
        vault.initialize(password)?;
        Ok(vault)
    }

    /// Open an existing vault. It starts locked.
    pub fn open<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(VaultError::VaultNotFound(root.display().to_string()));
        }

        let config = VaultConfig::load_or_default(&root)?;
        let backend = FsBackend::new(&root.join(BLOBS_DIR))?;
        Self::with_backend(&root, config, Arc::new(backend))
    }

    /// Vault whose credential lives under `root` and whose blobs live in
    /// `backend`
    pub fn with_backend(
        root: &Path,
        config: VaultConfig,
        backend: Arc<dyn BlobBackend>,
    ) -> VaultResult<Self> {
        let keys = Arc::new(VaultKeyHolder::new(config.idle_timeout()));
        let store = VaultFileStore::open(backend, Arc::clone(&keys), &config.blob_extension)?;

        Ok(Self {
            root: root.to_path_buf(),
            verifier: PasswordVerifier::new(root, config.verifier_kdf),
            config,
            keys,
            store: Arc::new(store),
            catalog: None,
        })
    }

    /// Scope catalog queries to an external catalog
    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the first password and unlock
    pub fn initialize(&self, password: &str) -> VaultResult<()> {
        if self.verifier.store().exists() {
            return Err(VaultError::VaultAlreadyInitialized(
                self.root.display().to_string(),
            ));
        }

        let credential = self.verifier.set_password(password, self.config.key_kdf)?;
        self.keys.install(derive_vault_key(password, &credential)?);

        log::info!("Vault initialized at {}", self.root.display());
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<VaultFileStore> {
        &self.store
    }

    // ═══════════════════════════════════════════════════════════════════════
    // UNLOCK / LOCK
    // ═══════════════════════════════════════════════════════════════════════

    /// Verify the password, derive and install the key, then migrate legacy
    /// blobs if configured. A migration failure is logged; the vault stays
    /// unlocked.
    pub fn unlock(&self, password: &str) -> VaultResult<UnlockOutcome> {
        let Some(credential) = self.load_credential()? else {
            return Ok(UnlockOutcome::VaultUninitialized);
        };

        match self.verifier.verify(password, &credential) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("Unlock rejected: wrong password");
                return Ok(UnlockOutcome::WrongPassword);
            }
            Err(VaultError::VaultUninitialized(reason)) => {
                log::warn!("Credential unusable: {}", reason);
                return Ok(UnlockOutcome::VaultUninitialized);
            }
            Err(e) => return Err(e),
        }

        self.keys.install(derive_vault_key(password, &credential)?);
        log::info!("Vault unlocked");

        let mut migrated = 0;
        if self.config.migrate_on_unlock {
            match self.migrate_unchecked(password, ProgressReporter::detached(), CancelFlag::new()) {
                Ok(report) => migrated = report.processed,
                Err(e) => log::warn!("Legacy migration after unlock failed: {}", e),
            }
        }

        Ok(UnlockOutcome::Unlocked { migrated })
    }

    /// Wipe the session key. On return no key is held.
    pub fn lock(&self) {
        self.keys.clear();
        log::info!("Vault locked");
    }

    /// Check if vault is unlocked
    pub fn is_unlocked(&self) -> bool {
        self.keys.is_unlocked()
    }

    pub fn state(&self) -> VaultState {
        if self.is_unlocked() {
            VaultState::Unlocked
        } else {
            VaultState::Locked
        }
    }

    fn load_credential(&self) -> VaultResult<Option<Credential>> {
        match self.verifier.load() {
            Ok(credential) => Ok(Some(credential)),
            Err(VaultError::VaultUninitialized(reason)) => {
                log::warn!("No usable credential: {}", reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Credential for a password, or `WrongPassword`
    fn check_password(&self, password: &str) -> VaultResult<Credential> {
        let credential = self.verifier.load()?;
        if !self.verifier.verify(password, &credential)? {
            return Err(VaultError::WrongPassword);
        }
        Ok(credential)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PASSWORD CHANGE
    // ═══════════════════════════════════════════════════════════════════════

    /// Re-encrypt the whole vault under a key derived from `new_password`
    pub fn change_password(&self, old_password: &str, new_password: &str) -> VaultResult<PasswordChange> {
        self.change_password_with(
            old_password,
            new_password,
            ProgressReporter::detached(),
            CancelFlag::new(),
        )
    }

    /// [`change_password`](Self::change_password) with progress and cancel.
    ///
    /// The new credential is persisted only after every blob has been
    /// rewritten. If persisting fails, the blobs are rewritten back. Refuses
    /// with `MigrationPending` while legacy blobs remain; damaged blobs are
    /// left as they are. On success the vault is unlocked under the new key.
    ///
    /// One exclusive lock covers the rewrite, the credential save, the key
    /// install and any restore pass, so no item write lands under a key
    /// that is about to be retired.
    pub fn change_password_with(
        &self,
        old_password: &str,
        new_password: &str,
        progress: ProgressReporter,
        cancel: CancelFlag,
    ) -> VaultResult<PasswordChange> {
        let current = match self.check_password(old_password) {
            Ok(credential) => credential,
            Err(VaultError::WrongPassword) => {
                log::warn!("Password change rejected: wrong old password");
                return Ok(PasswordChange::WrongOldPassword);
            }
            Err(e) => return Err(e),
        };

        let old_key = derive_vault_key(old_password, &current)?;
        let legacy_key = KeyDeriver::derive_legacy(old_password, &self.config.legacy_kdf)?;
        let next = self.verifier.prepare(new_password, self.config.key_kdf)?;
        let new_key = derive_vault_key(new_password, &next)?;

        let access = self.store.exclusive()?;

        let mut coordinator =
            ReEncryptionCoordinator::new(&self.store, progress, cancel).with_legacy_key(&legacy_key);
        let report = match coordinator.run_locked(&access, &old_key, &new_key) {
            Ok(report) => report,
            Err(e) => return failed_change(e),
        };

        if let Err(e) = self.verifier.persist(&next) {
            log::error!("New credential not saved, restoring blobs: {}", e);

            let mut reverse =
                ReEncryptionCoordinator::new(&self.store, ProgressReporter::detached(), CancelFlag::new())
                    .with_legacy_key(&legacy_key);
            return match reverse.run_locked(&access, &new_key, &old_key) {
                Ok(_) => Ok(PasswordChange::Failed(format!(
                    "password not changed, vault unchanged: credential not saved: {}",
                    e
                ))),
                Err(restore) => Err(VaultError::RollbackIncomplete {
                    blobs: Vec::new(),
                    cause: format!("credential not saved ({}); restore failed ({})", e, restore),
                }),
            };
        }

        self.keys.install(new_key);
        drop(access);

        log::info!("Password changed, {} blob(s) re-encrypted", report.processed);
        Ok(PasswordChange::Completed {
            rewritten: report.processed,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LEGACY MIGRATION
    // ═══════════════════════════════════════════════════════════════════════

    pub fn needs_migration(&self) -> VaultResult<bool> {
        self.store.needs_migration()
    }

    /// Rewrite legacy blobs. Requires the vault to be unlocked.
    pub fn migrate_legacy(&self, password: &str) -> VaultResult<MigrationReport> {
        self.migrate_legacy_with(password, ProgressReporter::detached(), CancelFlag::new())
    }

    pub fn migrate_legacy_with(
        &self,
        password: &str,
        progress: ProgressReporter,
        cancel: CancelFlag,
    ) -> VaultResult<MigrationReport> {
        self.check_password(password)?;
        self.migrate_unchecked(password, progress, cancel)
    }

    fn migrate_unchecked(
        &self,
        password: &str,
        progress: ProgressReporter,
        cancel: CancelFlag,
    ) -> VaultResult<MigrationReport> {
        if !self.store.needs_migration()? {
            return Ok(MigrationReport {
                processed: 0,
                total: 0,
                skipped: 0,
            });
        }

        let legacy_key = KeyDeriver::derive_legacy(password, &self.config.legacy_kdf)?;
        LegacyMigrator::with_progress(&self.store, progress, cancel)
            .migrate_to_session(&legacy_key, &self.keys)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ITEM OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Store one rendition of an item. Returns the plaintext length.
    pub fn import_item<R: Read>(&self, uuid: Uuid, role: BlobRole, source: R) -> VaultResult<u64> {
        self.store.write(&self.store.name_for(uuid, role), source)
    }

    /// Import a file as the primary blob of a new item
    pub fn import_file(&self, source: &Path) -> VaultResult<Uuid> {
        let uuid = Uuid::new_v4();
        let file = File::open(source)?;
        let size = self.import_item(uuid, BlobRole::Primary, file)?;
        log::info!("Imported {} as {} ({} bytes)", source.display(), uuid, size);
        Ok(uuid)
    }

    /// Whole, authenticated plaintext of an item rendition
    pub fn read_item(&self, uuid: Uuid, role: BlobRole) -> VaultResult<Zeroizing<Vec<u8>>> {
        let name = self.store.name_for(uuid, role);
        self.store
            .read_to_vec(&name)?
            .ok_or_else(|| VaultError::BlobNotFound(name.to_string()))
    }

    /// Stream an item rendition. Authentic only once read to the end.
    pub fn open_item(&self, uuid: Uuid, role: BlobRole) -> VaultResult<BlobReader> {
        let name = self.store.name_for(uuid, role);
        self.store
            .read(&name)?
            .ok_or_else(|| VaultError::BlobNotFound(name.to_string()))
    }

    /// Seekable stream for video playback
    pub fn open_video(&self, uuid: Uuid, role: BlobRole) -> VaultResult<SeekableBlob> {
        let name = self.store.name_for(uuid, role);
        self.store
            .open_seekable(&name)?
            .ok_or_else(|| VaultError::BlobNotFound(name.to_string()))
    }

    /// Remove every rendition of an item
    pub fn delete_item(&self, uuid: Uuid) -> VaultResult<()> {
        for role in BlobRole::ALL {
            self.store.delete(&self.store.name_for(uuid, role))?;
        }
        log::info!("Deleted item {}", uuid);
        Ok(())
    }

    pub fn list_blobs(&self) -> VaultResult<Vec<BlobName>> {
        self.store.list()
    }

    /// Blobs of catalog items, or every blob without a catalog
    pub fn catalog_blobs(&self) -> VaultResult<Vec<BlobName>> {
        match &self.catalog {
            Some(catalog) => self.store.blobs_for_catalog(catalog.as_ref()),
            None => self.store.list(),
        }
    }

    /// Blobs the catalog does not know. Empty without a catalog.
    pub fn orphans(&self) -> VaultResult<Vec<BlobName>> {
        match &self.catalog {
            Some(catalog) => self.store.orphans(catalog.as_ref()),
            None => Ok(Vec::new()),
        }
    }

    /// Authenticate every blob
    pub fn verify_all(&self) -> VaultResult<VerifyReport> {
        self.store.verify_all()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // BACKUP
    // ═══════════════════════════════════════════════════════════════════════

    pub fn export_backup(&self, destination: &Path) -> VaultResult<usize> {
        BackupPackager::new(&self.store).export(destination)
    }

    /// Merge an archive. With `verify`, entries that do not authenticate
    /// under the current key are rejected; that requires the vault unlocked.
    pub fn import_backup(&self, source: &Path, overwrite: bool, verify: bool) -> VaultResult<MergeResult> {
        let packager = BackupPackager::new(&self.store);
        if !verify {
            return packager.import(
                source,
                ImportOptions {
                    overwrite,
                    verify_key: None,
                },
            );
        }

        self.keys.with_key(|key| {
            packager.import(
                source,
                ImportOptions {
                    overwrite,
                    verify_key: Some(key),
                },
            )
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ASYNC WRAPPERS
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn unlock_async(self: &Arc<Self>, password: Zeroizing<String>) -> VaultResult<UnlockOutcome> {
        let vault = Arc::clone(self);
        run_blocking(move || vault.unlock(&password)).await
    }

    pub async fn change_password_async(
        self: &Arc<Self>,
        old_password: Zeroizing<String>,
        new_password: Zeroizing<String>,
        progress: ProgressReporter,
        cancel: CancelFlag,
    ) -> VaultResult<PasswordChange> {
        let vault = Arc::clone(self);
        run_blocking(move || {
            vault.change_password_with(&old_password, &new_password, progress, cancel)
        })
        .await
    }

    pub async fn migrate_async(
        self: &Arc<Self>,
        password: Zeroizing<String>,
        progress: ProgressReporter,
        cancel: CancelFlag,
    ) -> VaultResult<MigrationReport> {
        let vault = Arc::clone(self);
        run_blocking(move || vault.migrate_legacy_with(&password, progress, cancel)).await
    }
}

fn derive_vault_key(password: &str, credential: &Credential) -> VaultResult<VaultKey> {
    KeyDeriver::derive(password, &credential.key_salt_bytes()?, &credential.key_params)
}

/// Map a coordinator error to the caller-facing outcome. Errors that leave
/// the vault in an unknown state, or that the caller must act on, stay errors.
fn failed_change(e: VaultError) -> VaultResult<PasswordChange> {
    match e {
        VaultError::Busy | VaultError::MigrationPending(_) | VaultError::RollbackIncomplete { .. } => Err(e),
        other => Ok(PasswordChange::Failed(format!(
            "password not changed, vault unchanged: {}",
            other
        ))),
    }
}

async fn run_blocking<T, F>(f: F) -> VaultResult<T>
where
    F: FnOnce() -> VaultResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::TaskFailed(e.to_string()))?
}
