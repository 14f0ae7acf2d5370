//! # Media Vault
//!
//! Encrypted storage engine for a personal photo and video vault.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      MEDIA VAULT                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │  PASSWORD   │  │  KEY HOLDER │  │  BLOB STORE     │  │
//! │  │  VERIFIER   │  │  (session)  │  │  (streaming)    │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬────────┘  │
//! │         │                │                   │           │
//! │  ┌──────┴────────────────┴───────────────────┴────────┐ │
//! │  │        ChaCha20-Poly1305 stream, blob name as AAD   │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! │                                                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │  RE-ENCRYPT │  │  LEGACY     │  │  BACKUP         │  │
//! │  │  (password) │  │  MIGRATION  │  │  EXPORT/IMPORT  │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - One Argon2id-derived vault key, held only while unlocked
//! - Every blob carries a fresh nonce and is bound to its name
//! - Plaintext is never written to disk, not even in temp files
//! - Writes are atomic; vault-wide rewrites commit all or nothing
//! - Key material zeroized on drop

pub mod backup;
pub mod blob_store;
pub mod catalog;
pub mod config;
pub mod crypto;
pub mod error;
pub mod key_holder;
pub mod migration;
pub mod progress;
pub mod rotation;
pub mod storage;
pub mod vault;

pub use backup::{BackupManifest, BackupPackager, ImportOptions, MergeResult};
pub use blob_store::{BlobName, BlobReader, BlobRole, SeekableBlob, VaultFileStore, VerifyReport};
pub use catalog::{Catalog, MemoryCatalog};
pub use config::{KdfParams, VaultConfig};
pub use error::{VaultError, VaultResult};
pub use key_holder::VaultKeyHolder;
pub use migration::{LegacyMigrator, MigrationReport};
pub use progress::{CancelFlag, Progress, ProgressReporter, ProgressWatch};
pub use rotation::{ReEncryptionCoordinator, RekeyReport, RekeyState};
pub use storage::{BlobBackend, FsBackend, MemoryBackend};
pub use vault::{MediaVault, PasswordChange, UnlockOutcome, VaultState};

/// Media Vault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
