//! Media Vault - Blob Storage
//!
//! Raw byte storage behind the vault. Backends know nothing about
//! encryption; they hand out readers, atomic writers and names.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::error::{VaultError, VaultResult};

pub mod fs_backend;
pub mod memory;

pub use fs_backend::FsBackend;
pub use memory::MemoryBackend;

/// Suffix of in-flight temp files. Never listed as blobs.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Storage capability the vault runs on
pub trait BlobBackend: Send + Sync {
    /// Open a committed blob. `None` when it does not exist.
    fn open_read(&self, name: &str) -> VaultResult<Option<Box<dyn Read + Send>>>;

    /// Stored size of a committed blob
    fn len(&self, name: &str) -> VaultResult<Option<u64>>;

    /// Start writing a replacement for `name`. Nothing is visible under
    /// `name` until the staged blob is committed.
    fn open_write_atomic(&self, name: &str) -> VaultResult<Box<dyn BlobWriter>>;

    /// Remove a blob. Missing blobs are not an error.
    fn delete(&self, name: &str) -> VaultResult<()>;

    /// Names of all committed blobs, temp files excluded
    fn list(&self) -> VaultResult<Vec<String>>;

    /// Remove temp files left by an interrupted write. Returns how many.
    fn cleanup_stale_temps(&self) -> VaultResult<usize>;
}

/// Sink of an in-flight atomic write.
///
/// Dropped without [`finish`](BlobWriter::finish): the temp is discarded.
pub trait BlobWriter: Write + Send {
    /// Flush and make durable; the result can still be abandoned
    fn finish(self: Box<Self>) -> VaultResult<Box<dyn StagedBlob>>;
}

/// Complete, durable replacement waiting to become visible.
///
/// Dropped without [`commit`](StagedBlob::commit): the temp is discarded
/// and the previous blob stays in place.
pub trait StagedBlob: Send {
    fn name(&self) -> &str;

    /// Atomically replace the committed blob
    fn commit(self: Box<Self>) -> VaultResult<()>;
}

/// Temp file name for a write to `name`
pub(crate) fn temp_name(name: &str) -> String {
    format!("{}.{}{}", name, uuid::Uuid::new_v4().simple(), TEMP_SUFFIX)
}

/// Write a small file atomically: temp, fsync, rename
pub fn write_atomic(path: &Path, data: &[u8]) -> VaultResult<()> {
    write_atomic_with(path, |out| {
        out.write_all(data)?;
        Ok(())
    })
}

/// Stream into a temp next to `path` and rename over it once `fill`
/// succeeds. On error the temp is removed and `path` is untouched.
pub fn write_atomic_with<F>(path: &Path, fill: F) -> VaultResult<()>
where
    F: FnOnce(&mut BufWriter<File>) -> VaultResult<()>,
{
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| VaultError::InvalidBlobName(path.display().to_string()))?;
    let temp = parent.join(temp_name(file_name));

    let result = (|| -> VaultResult<()> {
        let file = OpenOptions::new().write(true).create_new(true).open(&temp)?;
        let mut out = BufWriter::new(file);
        fill(&mut out)?;

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&temp, path)?;
        sync_dir(parent);
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Make a rename durable. Not every platform can open a directory.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

pub(crate) fn is_temp(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX)
}
