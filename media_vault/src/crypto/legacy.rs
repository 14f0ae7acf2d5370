//! Media Vault - Legacy Blob Format
//!
//! ```text
//! [NONCE 12B][AES-256-GCM CIPHERTEXT || TAG 16B]
//! ```
//!
//! No magic, no associated data. Read-only in normal operation: legacy
//! blobs are only ever opened to be rewritten in the current format.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use super::keys::{generate_nonce, VaultKey, NONCE_LEN};
use crate::error::{VaultError, VaultResult};

/// GCM tag size
const GCM_TAG_LEN: usize = 16;

/// Smallest well-formed legacy blob (empty plaintext)
pub const MIN_LEGACY_LEN: usize = NONCE_LEN + GCM_TAG_LEN;

/// Decrypt a legacy blob
pub fn open(key: &VaultKey, blob: &[u8], name: &str) -> VaultResult<Zeroizing<Vec<u8>>> {
    if blob.len() < MIN_LEGACY_LEN {
        return Err(VaultError::LegacyFormat {
            blob: name.to_string(),
            reason: format!("{} bytes is shorter than nonce and tag", blob.len()),
        });
    }

    let cipher = Aes256Gcm::new_from_slice(key.expose()).map_err(|e| VaultError::LegacyFormat {
        blob: name.to_string(),
        reason: e.to_string(),
    })?;

    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::AuthenticationFailed {
            blob: name.to_string(),
        })
}

/// Produce a legacy blob. Only fixtures and tests write this format.
pub fn seal(key: &VaultKey, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| VaultError::KeyDerivationFailed(e.to_string()))?;

    let nonce_bytes = generate_nonce();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| VaultError::SerializationError(e.to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::stream::{detect_format, BlobFormat};

    #[test]
    fn test_legacy_roundtrip() {
        let key = VaultKey::generate();
        let blob = seal(&key, b"old photo").unwrap();
        assert_eq!(detect_format(&blob), BlobFormat::Legacy);

        let plaintext = open(&key, &blob, "a.mvb").unwrap();
        assert_eq!(&plaintext[..], b"old photo");
    }

    #[test]
    fn test_legacy_wrong_key() {
        let blob = seal(&VaultKey::generate(), b"old photo").unwrap();
        let err = open(&VaultKey::generate(), &blob, "a.mvb").unwrap_err();
        assert!(err.is_authentication_error());
    }

    #[test]
    fn test_legacy_too_short() {
        let key = VaultKey::generate();
        let err = open(&key, &[0u8; 20], "a.mvb").unwrap_err();
        assert!(matches!(err, VaultError::LegacyFormat { .. }));
    }
}
