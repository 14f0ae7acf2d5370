//! Media Vault - Password Verification
//!
//! Salted Argon2id PHC hash of the user password, stored as the single
//! credential record. Never touches blob content.

use std::path::{Path, PathBuf};

use argon2::password_hash::{self, PasswordHash, PasswordHasher, SaltString};
use argon2::{Algorithm, Argon2, PasswordVerifier as _, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::kdf::KeyDeriver;
use super::keys::generate_salt;
use crate::config::KdfParams;
use crate::error::{VaultError, VaultResult};
use crate::storage::write_atomic;

/// Credential file name inside the vault root
pub const CREDENTIAL_FILE: &str = "credential.json";

/// Current credential record version
pub const CREDENTIAL_VERSION: u32 = 1;

/// Stored credential. One record, replaced on password change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub version: u32,
    /// PHC string: algorithm, cost, salt and hash
    pub password_hash: String,
    /// Hex salt of the vault key derivation
    pub key_salt: String,
    /// Cost of the vault key derivation
    pub key_params: KdfParams,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn key_salt_bytes(&self) -> VaultResult<Vec<u8>> {
        hex::decode(&self.key_salt)
            .map_err(|e| VaultError::VaultUninitialized(format!("credential key salt: {}", e)))
    }
}

/// Persists the credential record
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(CREDENTIAL_FILE),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Missing or unreadable record is `VaultUninitialized`
    pub fn load(&self) -> VaultResult<Credential> {
        let data = std::fs::read(&self.path).map_err(|e| {
            VaultError::VaultUninitialized(format!("{}: {}", self.path.display(), e))
        })?;

        let credential: Credential = serde_json::from_slice(&data)
            .map_err(|e| VaultError::VaultUninitialized(format!("credential record: {}", e)))?;

        if credential.version != CREDENTIAL_VERSION {
            return Err(VaultError::VaultUninitialized(format!(
                "unknown credential version {}",
                credential.version
            )));
        }

        Ok(credential)
    }

    /// Replace the record atomically
    pub fn save(&self, credential: &Credential) -> VaultResult<()> {
        let data = serde_json::to_vec_pretty(credential)?;
        write_atomic(&self.path, &data)
    }
}

/// Hashes and verifies the user password
pub struct PasswordVerifier {
    params: KdfParams,
    store: CredentialStore,
}

impl PasswordVerifier {
    pub fn new(root: &Path, params: KdfParams) -> Self {
        Self {
            params,
            store: CredentialStore::new(root),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Hash the password and persist a new credential, replacing any prior one
    pub fn set_password(&self, password: &str, key_params: KdfParams) -> VaultResult<Credential> {
        let credential = self.prepare(password, key_params)?;
        self.store.save(&credential)?;
        Ok(credential)
    }

    /// Build a credential with a fresh key salt without persisting it
    pub fn prepare(&self, password: &str, key_params: KdfParams) -> VaultResult<Credential> {
        Ok(Credential {
            version: CREDENTIAL_VERSION,
            password_hash: self.hash(password)?,
            key_salt: hex::encode(KeyDeriver::fresh_salt()),
            key_params,
            created_at: Utc::now(),
        })
    }

    pub fn load(&self) -> VaultResult<Credential> {
        self.store.load()
    }

    pub fn persist(&self, credential: &Credential) -> VaultResult<()> {
        self.store.save(credential)
    }

    /// Check a password against a credential.
    ///
    /// A wrong password is `Ok(false)`; an unparsable hash is
    /// `VaultUninitialized`.
    pub fn verify(&self, password: &str, credential: &Credential) -> VaultResult<bool> {
        let parsed = PasswordHash::new(&credential.password_hash)
            .map_err(|e| VaultError::VaultUninitialized(format!("password hash: {}", e)))?;

        // Cost and salt come from the PHC string itself
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(VaultError::VaultUninitialized(format!("password hash: {}", e))),
        }
    }

    fn hash(&self, password: &str) -> VaultResult<String> {
        let salt = SaltString::encode_b64(&generate_salt())
            .map_err(|e| VaultError::PasswordHashFailed(e.to_string()))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.to_argon2()?);
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| VaultError::PasswordHashFailed(e.to_string()))?;

        Ok(hash.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_set_and_verify() {
        let dir = tempdir().unwrap();
        let verifier = PasswordVerifier::new(dir.path(), fast());

        verifier.set_password("correct horse", fast()).unwrap();
        let credential = verifier.load().unwrap();

        assert!(verifier.verify("correct horse", &credential).unwrap());
        assert!(!verifier.verify("wrong horse", &credential).unwrap());
        assert!(credential.password_hash.starts_with("$argon2id$"));
    }

    #[test]
    fn test_replace_on_write() {
        let dir = tempdir().unwrap();
        let verifier = PasswordVerifier::new(dir.path(), fast());

        let first = verifier.set_password("one", fast()).unwrap();
        let second = verifier.set_password("two", fast()).unwrap();
        assert_ne!(first.key_salt, second.key_salt);

        let stored = verifier.load().unwrap();
        assert!(!verifier.verify("one", &stored).unwrap());
        assert!(verifier.verify("two", &stored).unwrap());
    }

    #[test]
    fn test_missing_credential_is_uninitialized() {
        let dir = tempdir().unwrap();
        let verifier = PasswordVerifier::new(dir.path(), fast());
        assert!(matches!(verifier.load(), Err(VaultError::VaultUninitialized(_))));
    }

    #[test]
    fn test_corrupted_credential_is_uninitialized() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CREDENTIAL_FILE), b"{ not json").unwrap();
        let verifier = PasswordVerifier::new(dir.path(), fast());
        assert!(matches!(verifier.load(), Err(VaultError::VaultUninitialized(_))));

        let mut credential = verifier.prepare("pw", fast()).unwrap();
        credential.password_hash = "garbage".into();
        assert!(matches!(
            verifier.verify("pw", &credential),
            Err(VaultError::VaultUninitialized(_))
        ));
    }

    #[test]
    fn test_hash_salt_independent_of_key_salt() {
        let dir = tempdir().unwrap();
        let verifier = PasswordVerifier::new(dir.path(), fast());
        let credential = verifier.prepare("pw", fast()).unwrap();

        let parsed = PasswordHash::new(&credential.password_hash).unwrap();
        let hash_salt = parsed.salt.unwrap().as_str().to_string();
        assert!(!hash_salt.contains(&credential.key_salt));
        assert_eq!(credential.key_salt_bytes().unwrap().len(), 16);
    }
}
