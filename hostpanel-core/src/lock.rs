//! Advisory file locks shared between hostpanel processes.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{HostError, Result};

const RETRY_DELAY: Duration = Duration::from_millis(10);

/// An exclusive `flock` on a lock file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        Ok(file)
    }

    /// Try once; `None` when another holder has the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(lock = %path.display(), "acquired lock");
                Ok(Some(Self {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(_) => Ok(None),
        }
    }

    /// Retry until the lock is free or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = Self::open(path)?;
        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(lock = %path.display(), attempts, "acquired lock");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) => {
                    attempts += 1;
                    if start.elapsed() > timeout {
                        return Err(HostError::Lock(format!(
                            "Timeout waiting for {} after {} attempts: {}",
                            path.display(),
                            attempts,
                            e
                        )));
                    }
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path.display(), "failed to release lock: {}", e);
        }
    }
}
