//! Media Vault - In-Memory Backend
//!
//! Ephemeral vaults and tests. Clones share the same store.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{BlobBackend, BlobWriter, StagedBlob};
use crate::error::{VaultError, VaultResult};

#[derive(Default)]
struct Shared {
    blobs: RwLock<BTreeMap<String, Arc<[u8]>>>,
    fail_commit: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
}

/// Blob store held in process memory
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit of `name` fail with an I/O error
    pub fn fail_commit_of(&self, name: &str) {
        self.shared.fail_commit.lock().insert(name.to_string());
    }

    /// Raw stored bytes of a blob
    pub fn raw(&self, name: &str) -> Option<Vec<u8>> {
        self.shared.blobs.read().get(name).map(|b| b.to_vec())
    }

    /// Store bytes directly, bypassing the atomic write path
    pub fn put_raw(&self, name: &str, data: &[u8]) {
        self.shared
            .blobs
            .write()
            .insert(name.to_string(), Arc::from(data));
    }

    /// Writers and staged blobs not yet committed or dropped
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }
}

impl BlobBackend for MemoryBackend {
    fn open_read(&self, name: &str) -> VaultResult<Option<Box<dyn Read + Send>>> {
        Ok(self
            .shared
            .blobs
            .read()
            .get(name)
            .map(|data| Box::new(Cursor::new(Arc::clone(data))) as Box<dyn Read + Send>))
    }

    fn len(&self, name: &str) -> VaultResult<Option<u64>> {
        Ok(self.shared.blobs.read().get(name).map(|d| d.len() as u64))
    }

    fn open_write_atomic(&self, name: &str) -> VaultResult<Box<dyn BlobWriter>> {
        if name.is_empty() {
            return Err(VaultError::InvalidBlobName(name.to_string()));
        }
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryWriter(Pending {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
            data: Vec::new(),
        })))
    }

    fn delete(&self, name: &str) -> VaultResult<()> {
        self.shared.blobs.write().remove(name);
        Ok(())
    }

    fn list(&self) -> VaultResult<Vec<String>> {
        Ok(self.shared.blobs.read().keys().cloned().collect())
    }

    fn cleanup_stale_temps(&self) -> VaultResult<usize> {
        Ok(0)
    }
}

/// Bytes not yet visible; decrements the in-flight count on drop
struct Pending {
    shared: Arc<Shared>,
    name: String,
    data: Vec<u8>,
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryWriter(Pending);

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemoryWriter {
    fn finish(self: Box<Self>) -> VaultResult<Box<dyn StagedBlob>> {
        Ok(Box::new(MemoryStaged(self.0)))
    }
}

struct MemoryStaged(Pending);

impl StagedBlob for MemoryStaged {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn commit(mut self: Box<Self>) -> VaultResult<()> {
        let pending = &mut self.0;
        if pending.shared.fail_commit.lock().remove(&pending.name) {
            return Err(VaultError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("injected commit failure for {}", pending.name),
            )));
        }

        let data: Arc<[u8]> = Arc::from(std::mem::take(&mut pending.data));
        pending
            .shared
            .blobs
            .write()
            .insert(pending.name.clone(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_atomic_write() {
        let backend = MemoryBackend::new();
        backend.put_raw("a.mvb", b"old");

        let mut writer = backend.open_write_atomic("a.mvb").unwrap();
        writer.write_all(b"new").unwrap();
        let staged = writer.finish().unwrap();
        assert_eq!(backend.raw("a.mvb").unwrap(), b"old");
        assert_eq!(backend.in_flight(), 1);

        staged.commit().unwrap();
        assert_eq!(backend.raw("a.mvb").unwrap(), b"new");
        assert_eq!(backend.in_flight(), 0);
    }

    #[test]
    fn test_injected_commit_failure() {
        let backend = MemoryBackend::new();
        backend.put_raw("a.mvb", b"old");
        backend.fail_commit_of("a.mvb");

        let mut writer = backend.open_write_atomic("a.mvb").unwrap();
        writer.write_all(b"new").unwrap();
        assert!(writer.finish().unwrap().commit().is_err());
        assert_eq!(backend.raw("a.mvb").unwrap(), b"old");
        assert_eq!(backend.in_flight(), 0);

        // One-shot
        let mut writer = backend.open_write_atomic("a.mvb").unwrap();
        writer.write_all(b"new").unwrap();
        writer.finish().unwrap().commit().unwrap();
        assert_eq!(backend.raw("a.mvb").unwrap(), b"new");
    }

    #[test]
    fn test_clones_share_state() {
        let backend = MemoryBackend::new();
        let other = backend.clone();
        backend.put_raw("x.mvb", b"1");
        assert_eq!(other.list().unwrap(), vec!["x.mvb".to_string()]);
        other.delete("x.mvb").unwrap();
        assert!(backend.raw("x.mvb").is_none());
    }
}
