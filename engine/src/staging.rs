//! Local staging area.
//!
//! Files travel source -> local disk -> target. Each run stages under its own
//! uniquely named directory inside the configured staging root, so concurrent
//! runs sharing a root never see each other's files. The directory is
//! removed when the `Staging` is closed or dropped, on every exit path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;

/// Scratch directory owned by one run.
#[derive(Debug)]
pub struct Staging {
    dir: TempDir,
}

impl Staging {
    /// Create the run's directory under `root` (created if missing).
    ///
    /// # Errors
    /// Returns `EngineError::Staging` if the root or the run directory cannot
    /// be created
    pub fn create(root: &Path, run_id: Uuid) -> Result<Self, EngineError> {
        fs::create_dir_all(root).map_err(|e| EngineError::staging(root, e))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("transfer_{}_", run_id.simple()))
            .tempdir_in(root)
            .map_err(|e| EngineError::staging(root, e))?;
        debug!("Staging run {} in {}", run_id, dir.path().display());
        Ok(Staging { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Directory for one unit of work (the whole tree, or one chunk).
    pub fn unit_dir(&self, name: &str) -> Result<PathBuf, EngineError> {
        let path = self.dir.path().join(name);
        fs::create_dir_all(&path).map_err(|e| EngineError::staging(&path, e))?;
        Ok(path)
    }

    /// Where to write an archive named `name`, outside every unit directory.
    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove a staged file or directory once it has been uploaded.
    pub fn discard(&self, path: &Path) -> Result<(), EngineError> {
        let result = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| EngineError::staging(path, e))
    }

    /// Delete the run directory and everything left in it.
    pub fn close(self) -> Result<(), EngineError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| EngineError::staging(path, e))
    }
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns `EngineError::Staging` if the parent exists but is not a
/// directory, or cannot be created
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::staging(
            parent,
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::staging(parent, e))
        }
        Err(e) => Err(EngineError::staging(parent, e)),
    }
}

/// Stamp a staged file with the modification time the source reported.
///
/// Failure only loses the timestamp, so it is logged and swallowed.
pub fn preserve_mtime(path: &Path, modified: DateTime<Utc>) {
    let mtime = filetime::FileTime::from_unix_time(
        modified.timestamp(),
        modified.timestamp_subsec_nanos(),
    );
    if let Err(e) = filetime::set_file_mtime(path, mtime) {
        warn!("Could not set mtime on {}: {}", path.display(), e);
    }
}
