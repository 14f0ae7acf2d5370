//! Media Vault - Session Key Holder
//!
//! The single live vault key of an unlocked session. Borrowed per call,
//! never handed out; cleared on lock or after the idle timeout.

use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::crypto::VaultKey;
use crate::error::{VaultError, VaultResult};

struct HeldKey {
    key: VaultKey,
    last_used: Mutex<Instant>,
}

/// Holds the vault key while unlocked
pub struct VaultKeyHolder {
    slot: RwLock<Option<HeldKey>>,
    idle_timeout: Option<Duration>,
}

impl VaultKeyHolder {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            slot: RwLock::new(None),
            idle_timeout,
        }
    }

    /// Replace the held key. The previous key is zeroized.
    pub fn install(&self, key: VaultKey) {
        *self.slot.write() = Some(HeldKey {
            key,
            last_used: Mutex::new(Instant::now()),
        });
    }

    /// Wipe the key. Synchronous: on return no key is held.
    pub fn clear(&self) {
        if self.slot.write().take().is_some() {
            log::info!("Vault key cleared");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.expire_if_idle();
        self.slot.read().is_some()
    }

    /// Run `f` with the key borrowed. `VaultLocked` when no key is held or
    /// the idle timeout has passed. `clear` waits for `f`, so keep it short.
    pub fn with_key<T, F>(&self, f: F) -> VaultResult<T>
    where
        F: FnOnce(&VaultKey) -> VaultResult<T>,
    {
        self.expire_if_idle();

        let slot = self.slot.read();
        let held = slot.as_ref().ok_or(VaultError::VaultLocked)?;
        *held.last_used.lock() = Instant::now();
        f(&held.key)
    }

    fn expire_if_idle(&self) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };

        let idle = match self.slot.read().as_ref() {
            Some(held) => held.last_used.lock().elapsed() >= timeout,
            None => false,
        };

        if idle {
            log::info!("Vault idle for {:?}, locking", timeout);
            self.clear();
        }
    }
}

impl Default for VaultKeyHolder {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Where an operation borrows its key from
#[derive(Clone, Copy)]
pub enum KeySource<'a> {
    /// A key the caller holds for the whole operation
    Key(&'a VaultKey),
    /// The session key, re-borrowed at each use so `lock()` never waits on I/O
    Session(&'a VaultKeyHolder),
}

impl KeySource<'_> {
    pub fn borrow<T, F>(self, f: F) -> VaultResult<T>
    where
        F: FnOnce(&VaultKey) -> VaultResult<T>,
    {
        match self {
            KeySource::Key(key) => f(key),
            KeySource::Session(holder) => holder.with_key(f),
        }
    }
}

impl<'a> From<&'a VaultKey> for KeySource<'a> {
    fn from(key: &'a VaultKey) -> Self {
        KeySource::Key(key)
    }
}

impl<'a> From<&'a VaultKeyHolder> for KeySource<'a> {
    fn from(holder: &'a VaultKeyHolder) -> Self {
        KeySource::Session(holder)
    }
}
