//! Media Vault - Configuration
//!
//! `config.json` at the vault root. Missing file means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::storage::write_atomic;

/// Config file name inside the vault root
pub const CONFIG_FILE: &str = "config.json";

/// Default vault-internal blob extension
pub const DEFAULT_BLOB_EXTENSION: &str = "mvb";

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory in KiB
    pub memory_kib: u32,
    /// Iterations (time cost)
    pub iterations: u32,
    /// Lanes
    pub parallelism: u32,
}

impl KdfParams {
    /// Password verification: tuned for interactive unlock latency
    pub const fn verifier() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }

    /// Vault key derivation
    pub const fn key_derivation() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }

    /// Parameters the legacy scheme was written with
    pub const fn legacy() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 4,
        }
    }

    /// For weak devices
    pub const fn low_memory() -> Self {
        Self {
            memory_kib: 16 * 1024,
            iterations: 4,
            parallelism: 1,
        }
    }

    pub(crate) fn to_argon2(self) -> VaultResult<argon2::Params> {
        argon2::Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(crate::crypto::KEY_LEN),
        )
        .map_err(|e| VaultError::KeyDerivationFailed(format!("invalid Argon2 params: {}", e)))
    }
}

/// Vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Extension used in blob names (`<uuid>.<ext>`)
    pub blob_extension: String,
    /// Cost of the stored password hash
    pub verifier_kdf: KdfParams,
    /// Cost of vault key derivation for new credentials
    pub key_kdf: KdfParams,
    /// Cost the legacy scheme used
    pub legacy_kdf: KdfParams,
    /// Lock the vault after this many idle seconds
    pub idle_timeout_secs: Option<u64>,
    /// Rewrite legacy blobs right after unlock
    pub migrate_on_unlock: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            blob_extension: DEFAULT_BLOB_EXTENSION.into(),
            verifier_kdf: KdfParams::verifier(),
            key_kdf: KdfParams::key_derivation(),
            legacy_kdf: KdfParams::legacy(),
            idle_timeout_secs: Some(300),
            migrate_on_unlock: true,
        }
    }
}

impl VaultConfig {
    fn path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }

    /// Load config from the vault root, falling back to defaults
    pub fn load_or_default(root: &Path) -> VaultResult<Self> {
        let path = Self::path(root);
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read(&path)?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config atomically
    pub fn save(&self, root: &Path) -> VaultResult<()> {
        self.validate()?;
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(&Self::path(root), &data)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> VaultResult<()> {
        let ext = &self.blob_extension;
        let valid = !ext.is_empty()
            && ext.len() <= 16
            && ext.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid {
            return Err(VaultError::SerializationError(format!(
                "blob_extension must be 1-16 ASCII alphanumerics, got {:?}",
                ext
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_config_is_default() {
        let dir = tempdir().unwrap();
        let config = VaultConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.blob_extension, DEFAULT_BLOB_EXTENSION);
        assert!(config.migrate_on_unlock);
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir().unwrap();
        let config = VaultConfig {
            blob_extension: "vlt".into(),
            idle_timeout_secs: None,
            ..Default::default()
        };
        config.save(dir.path()).unwrap();

        let loaded = VaultConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.blob_extension, "vlt");
        assert_eq!(loaded.idle_timeout(), None);
        assert_eq!(loaded.key_kdf, KdfParams::key_derivation());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), br#"{"blob_extension":"abc"}"#).unwrap();

        let loaded = VaultConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.blob_extension, "abc");
        assert_eq!(loaded.verifier_kdf, KdfParams::verifier());
    }

    #[test]
    fn test_bad_extension_rejected() {
        let config = VaultConfig {
            blob_extension: "../x".into(),
            ..Default::default()
        };
        let dir = tempdir().unwrap();
        assert!(config.save(dir.path()).is_err());
    }
}
