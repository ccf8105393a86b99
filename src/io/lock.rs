//! OS file-lock bridge.
//!
//! Cross-process coordination uses an advisory lock on the table's
//! `table.lock` file: shared for readers, exclusive for the writer.
//! Within a process, lock state is tracked per handle; the caller is
//! responsible for not sharing a handle across threads without its own
//! synchronization.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::{Result, TableError};

/// Lock flavor: shared read or exclusive write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// Holder of the advisory lock on a table's lock file.
pub struct LockFile {
    file: File,
    path: PathBuf,
    held: Option<LockKind>,
}

// Granted-lock poll interval while waiting out `max_wait`.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

impl LockFile {
    /// Open (creating if absent) the lock file. No lock is taken.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            held: None,
        })
    }

    /// Acquire a lock of the given kind.
    ///
    /// `max_wait` of zero means non-blocking: the call fails with
    /// `WouldBlock` when the lock cannot be granted immediately.
    /// Upgrades (read to write) and downgrades release the old lock
    /// first.
    pub fn lock(&mut self, kind: LockKind, max_wait: Duration) -> Result<()> {
        if self.held == Some(kind) {
            return Ok(());
        }
        if self.held.is_some() {
            self.unlock()?;
        }
        let deadline = Instant::now() + max_wait;
        loop {
            let granted = match kind {
                LockKind::Read => self.file.try_lock_shared().is_ok(),
                LockKind::Write => self.file.try_lock_exclusive().is_ok(),
            };
            if granted {
                tracing::trace!(path = %self.path.display(), ?kind, "lock acquired");
                self.held = Some(kind);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TableError::WouldBlock);
            }
            std::thread::sleep(RETRY_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Release any held lock.
    pub fn unlock(&mut self) -> Result<()> {
        if self.held.take().is_some() {
            FileExt::unlock(&self.file)?;
            tracing::trace!(path = %self.path.display(), "lock released");
        }
        Ok(())
    }

    /// Whether this handle currently holds a lock satisfying `kind`.
    /// A write lock satisfies a read query.
    pub fn has_lock(&self, kind: LockKind) -> bool {
        match (self.held, kind) {
            (Some(LockKind::Write), _) => true,
            (Some(LockKind::Read), LockKind::Read) => true,
            _ => false,
        }
    }

    pub fn held(&self) -> Option<LockKind> {
        self.held
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}
