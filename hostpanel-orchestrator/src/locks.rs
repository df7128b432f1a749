//! Per-domain exclusion: an in-process set guarded by a condition variable,
//! backed by an advisory lock file for other hostpanel processes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use hostpanel_core::FileLock;

use crate::error::{OrchestratorError, Result};

const IN_PROCESS_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct DomainLocks {
    dir: PathBuf,
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Held for the duration of one reconciliation.
#[derive(Debug)]
pub struct DomainGuard<'a> {
    locks: &'a DomainLocks,
    domain: String,
    _file: FileLock,
}

impl DomainLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for other threads of this process, then take the lock file.
    ///
    /// A lock file held by another process is reported as
    /// [`OrchestratorError::Busy`] right away.
    pub fn lock(&self, domain: &str) -> Result<DomainGuard<'_>> {
        let deadline = Instant::now() + IN_PROCESS_WAIT;
        let mut held = self.held();
        while held.contains(domain) {
            let now = Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::Busy(domain.to_string()));
            }
            held = self
                .released
                .wait_timeout(held, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        held.insert(domain.to_string());
        drop(held);

        let path = self.dir.join(format!("{}.lock", domain));
        let file = match FileLock::try_acquire(&path) {
            Ok(Some(file)) => file,
            Ok(None) => {
                self.release(domain);
                return Err(OrchestratorError::Busy(domain.to_string()));
            }
            Err(e) => {
                self.release(domain);
                return Err(e.into());
            }
        };
        debug!(domain, "domain lock acquired");

        Ok(DomainGuard {
            locks: self,
            domain: domain.to_string(),
            _file: file,
        })
    }

    fn release(&self, domain: &str) {
        self.held().remove(domain);
        self.released.notify_all();
    }
}

impl Drop for DomainGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.domain);
    }
}
