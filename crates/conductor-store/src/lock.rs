//! Exclusive sidecar file locks.
//!
//! Every store file is guarded by a `<name>.lock` sidecar. The lock is an
//! OS-level exclusive flock held for the duration of one read-modify-write,
//! so concurrent engine tasks and a second process (a CLI inspecting the
//! data dir) cannot interleave partial writes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::StoreError;
use crate::paths::DataDir;

/// How long to wait for an exclusive lock before giving up.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting on a held lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// An acquired exclusive lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire the exclusive lock guarding `target`, waiting up to
    /// [`LOCK_TIMEOUT`].
    pub fn acquire(target: &Path) -> Result<Self, StoreError> {
        Self::acquire_with_timeout(target, LOCK_TIMEOUT)
    }

    /// Acquire with an explicit timeout. A zero timeout attempts exactly once.
    pub fn acquire_with_timeout(target: &Path, timeout: Duration) -> Result<Self, StoreError> {
        let lock_path = DataDir::lock_for(target);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: lock_path,
                    });
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(_) => return Err(StoreError::LockTimeout(lock_path)),
            }
        }
    }

    /// Path of the sidecar lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Dropping the file would release the flock anyway; unlock explicitly
        // so failures are observable in logs.
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release file lock");
        }
    }
}
