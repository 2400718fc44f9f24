//! Data directory locking
//!
//! One store owns its directory. The lock is an OS-level advisory lock on
//! `{data_dir}/.lock`, released when the handle is dropped or the process dies.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{FlatError, Result};

/// Lock file name inside the data directory
pub const LOCK_FILENAME: &str = ".lock";

/// Exclusive lock on a data directory
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Create the directory if needed and lock it without blocking
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILENAME);
        let file = File::create(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Acquired data directory lock");
                Ok(Self { file, path })
            }
            Err(e) if Self::is_contended(&e) => {
                tracing::error!(
                    path = %data_dir.display(),
                    "Data directory is already locked by another instance"
                );
                Err(FlatError::AlreadyLocked(data_dir.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_contended(e: &io::Error) -> bool {
        e.kind() == io::ErrorKind::WouldBlock
            || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to release data directory lock");
        } else {
            tracing::debug!(path = %self.path.display(), "Released data directory lock");
        }
    }
}
