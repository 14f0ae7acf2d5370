//! Media Vault - Key Derivation
//!
//! Password → vault key. Argon2id with its own salt and cost, then HKDF
//! into a fixed-length key. Independent of the stored password hash.

use argon2::{Algorithm, Argon2, Version};
use zeroize::Zeroizing;

use super::keys::{contexts, derive_key, generate_salt, VaultKey, KEY_LEN, SALT_LEN};
use crate::config::KdfParams;
use crate::error::{VaultError, VaultResult};

/// Fixed application salt of the legacy scheme
const LEGACY_SALT: &[u8] = b"MEDIA_VAULT_SALT_v1";

/// Stateless password-to-key derivation
pub struct KeyDeriver;

impl KeyDeriver {
    /// Fresh random salt for setup or password change
    pub fn fresh_salt() -> [u8; SALT_LEN] {
        generate_salt()
    }

    /// Derive the vault key. Same inputs always yield the same key.
    pub fn derive(password: &str, salt: &[u8], params: &KdfParams) -> VaultResult<VaultKey> {
        if salt.len() < 8 {
            return Err(VaultError::KeyDerivationFailed(format!(
                "salt too short: {} bytes",
                salt.len()
            )));
        }

        let ikm = argon2_raw(password, salt, params)?;
        derive_key(&*ikm, salt, contexts::VAULT_KEY)
    }

    /// Derive the key the legacy scheme used for the same password
    pub fn derive_legacy(password: &str, params: &KdfParams) -> VaultResult<VaultKey> {
        let ikm = argon2_raw(password, LEGACY_SALT, params)?;
        derive_key(&*ikm, b"", contexts::LEGACY_KEY)
    }
}

fn argon2_raw(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);

    let mut output = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut *output)
        .map_err(|e| VaultError::KeyDerivationFailed(e.to_string()))?;

    Ok(output)
}
