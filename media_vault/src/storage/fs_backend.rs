//! Media Vault - Local Directory Backend
//!
//! One flat directory of blobs. Writes go to `<name>.<random>.tmp`, are
//! fsynced, then renamed over the target.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::{is_temp, sync_dir, temp_name, BlobBackend, BlobWriter, StagedBlob};
use crate::error::{VaultError, VaultResult};

/// Blob directory on the local filesystem
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Use `root` as the blob directory, creating it if needed
    pub fn new(root: &Path) -> VaultResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get full path for a blob, rejecting anything that could escape the root
    fn full_path(&self, name: &str) -> VaultResult<PathBuf> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !plain {
            return Err(VaultError::InvalidBlobName(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

impl BlobBackend for FsBackend {
    fn open_read(&self, name: &str) -> VaultResult<Option<Box<dyn Read + Send>>> {
        let path = self.full_path(name)?;
        match File::open(&path) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn len(&self, name: &str) -> VaultResult<Option<u64>> {
        let path = self.full_path(name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open_write_atomic(&self, name: &str) -> VaultResult<Box<dyn BlobWriter>> {
        let target = self.full_path(name)?;
        let temp = self.root.join(temp_name(name));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)?;

        Ok(Box::new(FsWriter {
            out: Some(BufWriter::new(file)),
            temp,
            target,
            name: name.to_string(),
        }))
    }

    fn delete(&self, name: &str) -> VaultResult<()> {
        let path = self.full_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&self.root);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> VaultResult<Vec<String>> {
        let mut names = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !is_temp(name) {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    fn cleanup_stale_temps(&self) -> VaultResult<usize> {
        let mut removed = 0;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let stale = entry.file_name().to_str().map(is_temp).unwrap_or(false);
            if stale && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("Removed {} stale temp file(s) from {}", removed, self.root.display());
        }
        Ok(removed)
    }
}

/// Writer over a temp file; removes it unless finished
struct FsWriter {
    out: Option<BufWriter<File>>,
    temp: PathBuf,
    target: PathBuf,
    name: String,
}

impl FsWriter {
    fn out(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.out
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer already finished"))
    }
}

impl Write for FsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out()?.flush()
    }
}

impl BlobWriter for FsWriter {
    fn finish(mut self: Box<Self>) -> VaultResult<Box<dyn StagedBlob>> {
        let out = self.out.take().ok_or_else(|| {
            VaultError::Io(io::Error::new(io::ErrorKind::Other, "writer already finished"))
        })?;

        // The temp belongs to the staged blob from here on, or is removed
        let staged = FsStaged {
            temp: std::mem::take(&mut self.temp),
            target: std::mem::take(&mut self.target),
            name: std::mem::take(&mut self.name),
            committed: false,
        };

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(Box::new(staged))
    }
}

impl Drop for FsWriter {
    fn drop(&mut self) {
        if self.out.take().is_some() {
            let _ = fs::remove_file(&self.temp);
        }
    }
}

/// Durable temp file awaiting rename
struct FsStaged {
    temp: PathBuf,
    target: PathBuf,
    name: String,
    committed: bool,
}

impl StagedBlob for FsStaged {
    fn name(&self) -> &str {
        &self.name
    }

    fn commit(mut self: Box<Self>) -> VaultResult<()> {
        fs::rename(&self.temp, &self.target)?;
        self.committed = true;
        if let Some(dir) = self.target.parent() {
            sync_dir(dir);
        }
        Ok(())
    }
}

impl Drop for FsStaged {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp);
        }
    }
}
