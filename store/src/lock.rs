//! Advisory cross-process locking for cooperating schedulers.
//!
//! The lock is an OS-level advisory file lock (released automatically on
//! process exit), taken around scheduler polls and event appends so that
//! multiple processes sharing one project root do not interleave mutations.

use aof_core::{AofError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive advisory lock on `<lock_dir>/<name>.lock`, held until drop.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock, waiting up to `timeout`. The lock directory is
    /// created when missing.
    pub async fn acquire(lock_dir: &Path, name: &str, timeout: Duration) -> Result<DirLock> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(lock_dir, name)? {
                return Ok(lock);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AofError::Io(format!(
                    "timed out acquiring lock '{name}' in {}",
                    lock_dir.display()
                )));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Try to acquire the lock without waiting. `Ok(None)` when another
    /// process holds it.
    pub fn try_acquire(lock_dir: &Path, name: &str) -> Result<Option<DirLock>> {
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(DirLock { file, path })),
            Err(e)
                if e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release dir lock");
        }
    }
}
