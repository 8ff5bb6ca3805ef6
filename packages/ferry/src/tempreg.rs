//! Tracking temporary files and directories created mid-operation so they
//! can be cleaned up if the process is interrupted before committing them.
//!
//! [`transport::fetch_file`][crate::transport] writes into a tempfile and
//! renames it into place only on success; if a signal arrives first, the
//! half-written tempfile would otherwise leak. A [`TempRegistry`] is the
//! single place that knows about every outstanding tempfile/dir, so shutdown
//! can sweep them all without each call site tracking its own cleanup list.
//!
//! This is deliberately a registry a caller owns (typically one per
//! [`crate::cache::Cache`]), not a bare process-wide global: a global would
//! make it impossible to run two independent caches in the same process
//! (as the test suite does) without one's cleanup racing the other's.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{instrument, warn};

use crate::error::Error;

/// A registry of outstanding temp paths, drained on shutdown.
#[derive(Debug, Default)]
pub struct TempRegistry {
    files: Mutex<HashSet<PathBuf>>,
    dirs: Mutex<HashSet<PathBuf>>,
}

impl TempRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tempfile under `dir` and register it.
    pub fn mktempfile(&self, dir: &Path, prefix: &str) -> Result<tempfile::NamedTempFile, Error> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(dir)
            .map_err(|err| Error::new(format!("failed to create tempfile in {}: {err}", dir.display())))?;
        self.files.lock().expect("tempfile registry poisoned").insert(file.path().to_path_buf());
        Ok(file)
    }

    /// Create a temp directory under `dir` and register it.
    pub fn mktempdir(&self, dir: &Path, prefix: &str) -> Result<tempfile::TempDir, Error> {
        let tmp = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(dir)
            .map_err(|err| Error::new(format!("failed to create tempdir in {}: {err}", dir.display())))?;
        self.dirs.lock().expect("tempdir registry poisoned").insert(tmp.path().to_path_buf());
        Ok(tmp)
    }

    /// Unregister a tempfile that has been committed (renamed into place) or
    /// otherwise no longer needs sweeping. Does not touch the filesystem.
    pub fn forget_file(&self, path: &Path) {
        self.files.lock().expect("tempfile registry poisoned").remove(path);
    }

    /// Unregister a tempdir that has been committed or otherwise no longer
    /// needs sweeping. Does not touch the filesystem.
    pub fn forget_dir(&self, path: &Path) {
        self.dirs.lock().expect("tempdir registry poisoned").remove(path);
    }

    /// Remove every still-registered temp path from disk.
    ///
    /// Changes the process's current directory to `/` first: on Unix,
    /// removing a directory that is also the current working directory of
    /// some process can behave surprisingly, and this registry's cleanup
    /// runs during shutdown where nothing else depends on the current
    /// directory.
    #[instrument(skip(self))]
    pub fn drain(&self) {
        #[cfg(unix)]
        {
            if let Err(err) = std::env::set_current_dir("/") {
                warn!(%err, "failed to chdir to / before temp cleanup");
            }
        }

        for path in self.files.lock().expect("tempfile registry poisoned").drain() {
            if let Err(err) = std::fs::remove_file(&path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), %err, "failed to remove temp file");
            }
        }

        for path in self.dirs.lock().expect("tempdir registry poisoned").drain() {
            if let Err(err) = std::fs::remove_dir_all(&path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), %err, "failed to remove temp dir");
            }
        }
    }

    /// The number of still-registered temp files and directories. Intended
    /// for tests asserting that commits forget their tempfiles.
    pub fn len(&self) -> usize {
        self.files.lock().expect("tempfile registry poisoned").len()
            + self.dirs.lock().expect("tempdir registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mktempfile_registers_and_forget_unregisters() {
        let reg = TempRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let file = reg.mktempfile(dir.path(), "ferry-").unwrap();
        assert_eq!(reg.len(), 1);
        reg.forget_file(file.path());
        assert!(reg.is_empty());
    }

    #[test]
    fn drain_removes_unforgotten_files_and_dirs() {
        let reg = TempRegistry::new();
        let parent = tempfile::tempdir().unwrap();
        let file = reg.mktempfile(parent.path(), "ferry-").unwrap();
        let file_path = file.path().to_path_buf();
        let nested = reg.mktempdir(parent.path(), "ferry-dir-").unwrap();
        let nested_path = nested.path().to_path_buf();
        std::mem::forget(file);
        std::mem::forget(nested);

        assert_eq!(reg.len(), 2);
        reg.drain();
        assert!(reg.is_empty());
        assert!(!file_path.exists());
        assert!(!nested_path.exists());
    }
}
