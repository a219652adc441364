//! Exclusive lock file serializing runs against one store.

use crate::error::{CliError, CliResult};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Holds `<store>.lock` until dropped.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    /// Lock file path for a store snapshot.
    pub fn path_for(store: &Path) -> PathBuf {
        let mut name = store.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Create the lock file. Fails if another run holds it.
    pub fn acquire(store: &Path) -> CliResult<Self> {
        let path = Self::path_for(store);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CliError::Locked {
                    path: store.to_path_buf(),
                    lock: path,
                })
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        debug!(lock = %path.display(), "Acquired store lock");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to remove store lock");
        }
    }
}
