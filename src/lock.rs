//! Single-instance lock file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Guard holding the single-instance lock. The lock file is removed when the
/// guard drops, which covers every exit path of the process.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock, failing when another instance already holds it.
    pub fn acquire(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        // write our pid so a human can tell which process holds the lock
        let _ = write!(file, "{}", std::process::id());
        Ok(Self { path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// =============================================================================
// Tests
// =============================================================================
