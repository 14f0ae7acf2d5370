//! Media Vault - Key Material
//!
//! The vault key and the HKDF helpers it is derived with.

use std::fmt;

use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;

use crate::error::{VaultError, VaultResult};

/// Key length for AES-256 / ChaCha20
pub const KEY_LEN: usize = 32;

/// Nonce length for AES-GCM and IETF ChaCha20
pub const NONCE_LEN: usize = 12;

/// Salt length for both Argon2 derivations
pub const SALT_LEN: usize = 16;

/// HKDF contexts for key derivation
pub mod contexts {
    /// Vault key from the Argon2id output
    pub const VAULT_KEY: &[u8] = b"MEDIA_VAULT:KEY:v2";

    /// Vault key as the legacy scheme derived it
    pub const LEGACY_KEY: &[u8] = b"MEDIA_VAULT:KEY:v1";
}

/// Symmetric vault key.
///
/// Not `Clone`: one live instance per unlocked session, borrowed for the
/// duration of a single operation. Zeroized on drop.
pub struct VaultKey {
    inner: Secret<[u8; KEY_LEN]>,
}

impl VaultKey {
    /// Create a new vault key from bytes
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(bytes)
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey([REDACTED])")
    }
}

/// Derive a key using HKDF-SHA256
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> VaultResult<VaultKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];

    hk.expand(info, &mut okm)
        .map_err(|e| VaultError::KeyDerivationFailed(e.to_string()))?;

    Ok(VaultKey::new(okm))
}

/// Generate a random nonce
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Generate a random salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_deterministic() {
        let k1 = derive_key(&[0x42; 32], b"salt", contexts::VAULT_KEY).unwrap();
        let k2 = derive_key(&[0x42; 32], b"salt", contexts::VAULT_KEY).unwrap();
        assert_eq!(k1.expose(), k2.expose());

        let legacy = derive_key(&[0x42; 32], b"salt", contexts::LEGACY_KEY).unwrap();
        assert_ne!(k1.expose(), legacy.expose());
    }

    #[test]
    fn test_debug_redacts() {
        let key = VaultKey::new([7u8; KEY_LEN]);
        let shown = format!("{:?}", key);
        assert!(!shown.contains('7'));
    }

    #[test]
    fn test_nonces_differ() {
        assert_ne!(generate_nonce(), generate_nonce());
        assert_ne!(generate_salt(), generate_salt());
    }
}
