//! Media Vault - Cryptographic Core
//!
//! Key derivation, password verification and the blob formats.

pub mod kdf;
pub mod keys;
pub mod legacy;
pub mod password;
pub mod stream;

pub use kdf::KeyDeriver;
pub use keys::*;
pub use password::{Credential, CredentialStore, PasswordVerifier};
pub use stream::{
    open_to_vec, detect_format, seal_to_vec, BlobFormat, DecryptingReader, EncryptingWriter,
    HEADER_LEN, MAGIC, OVERHEAD, TAG_LEN,
};
