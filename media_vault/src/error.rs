//! Media Vault - Error Types

use std::io;

use thiserror::Error;

/// Result type for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Vault error types
#[derive(Error, Debug)]
pub enum VaultError {
    // ═══════════════════════════════════════════════════════════════
    // AUTHENTICATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Authentication failed for blob {blob} - corrupted or wrong key")]
    AuthenticationFailed { blob: String },

    #[error("Wrong password")]
    WrongPassword,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Password hashing failed: {0}")]
    PasswordHashFailed(String),

    // ═══════════════════════════════════════════════════════════════
    // INTEGRITY ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Blob {blob} is shorter than its framing")]
    TruncatedStream { blob: String },

    #[error("Blob {blob} has an unrecognized header")]
    UnrecognizedFormat { blob: String },

    #[error("Legacy blob {blob} could not be parsed: {reason}")]
    LegacyFormat { blob: String, reason: String },

    #[error("Unsupported backup version {found} (this build reads up to {supported})")]
    UnsupportedBackupVersion { found: u32, supported: u32 },

    #[error("Backup archive corrupted: {0}")]
    CorruptBackup(String),

    // ═══════════════════════════════════════════════════════════════
    // VAULT STATE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Vault is locked")]
    VaultLocked,

    #[error("Vault is not initialized: {0}")]
    VaultUninitialized(String),

    #[error("Vault already initialized at: {0}")]
    VaultAlreadyInitialized(String),

    #[error("Vault not found at: {0}")]
    VaultNotFound(String),

    #[error("Another vault-wide operation is in progress")]
    Busy,

    #[error("Legacy blobs must be migrated first ({0} remaining)")]
    MigrationPending(usize),

    #[error("Operation cancelled before any blob was rewritten")]
    Cancelled,

    // ═══════════════════════════════════════════════════════════════
    // REWRITE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Rewrite aborted at {blob}, vault unchanged: {source}")]
    RewriteAborted {
        blob: String,
        #[source]
        source: Box<VaultError>,
    },

    #[error("Rollback incomplete for {} blob(s) after: {cause}", blobs.len())]
    RollbackIncomplete { blobs: Vec<String>, cause: String },

    // ═══════════════════════════════════════════════════════════════
    // FILE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Invalid blob name: {0}")]
    InvalidBlobName(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("IO error: {0}")]
    Io(#[source] io::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    // ═══════════════════════════════════════════════════════════════
    // SERIALIZATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl VaultError {
    /// Tag mismatch on a blob (wrong key or tampered data) or a rejected password
    pub fn is_authentication_error(&self) -> bool {
        matches!(
            self,
            VaultError::AuthenticationFailed { .. } | VaultError::WrongPassword
        )
    }

    /// Data corruption that is reported per item
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            VaultError::TruncatedStream { .. }
                | VaultError::UnrecognizedFormat { .. }
                | VaultError::LegacyFormat { .. }
                | VaultError::UnsupportedBackupVersion { .. }
                | VaultError::CorruptBackup(_)
        )
    }

    /// Vault-wide state is unknown and needs manual attention
    pub fn is_security_critical(&self) -> bool {
        matches!(self, VaultError::RollbackIncomplete { .. })
    }
}

/// Per-blob stream failure, carried through `std::io::Error` by the
/// streaming readers and unwrapped again at the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamFault {
    #[error("authentication tag mismatch")]
    AuthenticationFailed,
    #[error("stream shorter than its framing")]
    TruncatedStream,
    #[error("unrecognized header")]
    UnrecognizedFormat,
}

/// A [`StreamFault`] tagged with the blob it happened on
#[derive(Debug, Clone, Error)]
#[error("{blob}: {fault}")]
pub struct BlobFault {
    pub blob: String,
    pub fault: StreamFault,
}

impl BlobFault {
    pub fn new(blob: &str, fault: StreamFault) -> Self {
        Self {
            blob: blob.to_string(),
            fault,
        }
    }

    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }
}

impl From<BlobFault> for VaultError {
    fn from(f: BlobFault) -> Self {
        match f.fault {
            StreamFault::AuthenticationFailed => VaultError::AuthenticationFailed { blob: f.blob },
            StreamFault::TruncatedStream => VaultError::TruncatedStream { blob: f.blob },
            StreamFault::UnrecognizedFormat => VaultError::UnrecognizedFormat { blob: f.blob },
        }
    }
}

impl From<VaultError> for io::Error {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

impl From<io::Error> for VaultError {
    fn from(e: io::Error) -> Self {
        let ours = e
            .get_ref()
            .is_some_and(|inner| inner.is::<BlobFault>() || inner.is::<VaultError>());
        if !ours {
            return VaultError::Io(e);
        }

        let kind = e.kind();
        match e.into_inner() {
            Some(inner) => match inner.downcast::<BlobFault>() {
                Ok(fault) => VaultError::from(*fault),
                Err(inner) => match inner.downcast::<VaultError>() {
                    Ok(err) => *err,
                    Err(other) => VaultError::Io(io::Error::new(kind, other)),
                },
            },
            None => VaultError::Io(io::Error::from(kind)),
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::SerializationError(e.to_string())
    }
}

impl From<bincode::Error> for VaultError {
    fn from(e: bincode::Error) -> Self {
        VaultError::CorruptBackup(e.to_string())
    }
}
