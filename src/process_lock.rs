//! Lock-guarded process singleton.
//!
//! Exactly one OS process in a multi-worker deployment may drive the
//! scheduler clock. Ownership is an advisory, non-blocking exclusive lock on
//! a well-known file, keyed by the pid that acquired it.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use fs2::FileExt;
use tracing::{error, info, warn};

/// Advisory file lock owned by a single process.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    handle: Option<File>,
    owner_pid: Option<u32>,
    /// Set when acquisition degraded because the platform cannot lock
    degraded: bool,
}

impl ProcessLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handle: None,
            owner_pid: None,
            degraded: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the calling process owns the lock.
    pub fn is_held(&self) -> bool {
        self.owner_pid == Some(std::process::id()) && (self.handle.is_some() || self.degraded)
    }

    /// Attempts to take ownership without blocking.
    ///
    /// Contention is the expected outcome for all but one worker and is
    /// reported as `false` at info level, never as an error.
    pub fn try_acquire(&mut self) -> bool {
        let pid = std::process::id();

        if self.owner_pid.is_some() && self.owner_pid != Some(pid) {
            // Handle inherited across fork. Closing our copy leaves the
            // parent's lock intact; unlocking it would not.
            info!(
                inherited_from = ?self.owner_pid,
                pid,
                "ignoring inherited scheduler lock handle"
            );
            self.handle = None;
            self.owner_pid = None;
            self.degraded = false;
        }

        if self.is_held() {
            return true;
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(err) = std::fs::create_dir_all(parent)
        {
            warn!(path = %self.path.display(), error = %err, "cannot create scheduler lock directory");
            return false;
        }

        // Do not truncate before holding the lock: the owner's pid lives in the file.
        let file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot open scheduler lock file");
                return false;
            }
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut file = file;
                if let Err(err) = write_pid(&mut file, pid) {
                    warn!(error = %err, "failed to record pid in scheduler lock file");
                }
                info!(path = %self.path.display(), pid, "acquired scheduler lock");
                self.handle = Some(file);
                self.owner_pid = Some(pid);
                true
            }
            Err(err) if is_contended(&err) => {
                info!(
                    path = %self.path.display(),
                    pid,
                    "scheduler lock held by another process; skipping scheduler startup"
                );
                false
            }
            Err(err) => {
                error!(
                    path = %self.path.display(),
                    error = %err,
                    "advisory file locking unsupported; assuming scheduler ownership. \
                     Multiple workers may now run the scheduler concurrently"
                );
                self.degraded = true;
                self.owner_pid = Some(pid);
                true
            }
        }
    }

    /// Releases ownership. Safe to call repeatedly or without holding the lock.
    pub fn release(&mut self) {
        let pid = std::process::id();
        if self.owner_pid != Some(pid) {
            self.handle = None;
            self.owner_pid = None;
            return;
        }

        if let Some(file) = self.handle.take() {
            if let Err(err) = FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %err, "failed to unlock scheduler lock");
            } else {
                info!(path = %self.path.display(), pid, "released scheduler lock");
            }
        }
        self.owner_pid = None;
        self.degraded = false;
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn write_pid(file: &mut File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{pid}")?;
    file.flush()
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == io::ErrorKind::WouldBlock
}

static PROCESS_LOCK: OnceLock<Mutex<Option<ProcessLock>>> = OnceLock::new();

fn global() -> &'static Mutex<Option<ProcessLock>> {
    PROCESS_LOCK.get_or_init(|| Mutex::new(None))
}

/// Acquires the process-wide scheduler lock at `path`.
///
/// The lock stays held until [`release_process_lock`] or process exit.
pub fn try_acquire_process_lock(path: &Path) -> bool {
    let mut slot = global().lock().unwrap_or_else(|poison| poison.into_inner());
    match slot.as_mut() {
        Some(lock) if lock.path() == path => lock.try_acquire(),
        _ => {
            let mut lock = ProcessLock::new(path);
            let acquired = lock.try_acquire();
            *slot = Some(lock);
            acquired
        }
    }
}

/// Releases the process-wide scheduler lock, if held.
pub fn release_process_lock() {
    let mut slot = global().lock().unwrap_or_else(|poison| poison.into_inner());
    if let Some(mut lock) = slot.take() {
        lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn only_one_holder_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");

        let mut first = ProcessLock::new(&path);
        let mut second = ProcessLock::new(&path);

        assert!(first.try_acquire());
        assert!(!second.try_acquire());
        assert!(first.is_held());
        assert!(!second.is_held());

        first.release();
        assert!(second.try_acquire());
    }

    #[test]
    fn acquire_is_reentrant_for_the_owner() {
        let dir = tempdir().unwrap();
        let mut lock = ProcessLock::new(dir.path().join("scheduler.lock"));
        assert!(lock.try_acquire());
        assert!(lock.try_acquire());
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut lock = ProcessLock::new(dir.path().join("scheduler.lock"));
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
        lock.release();
        assert!(!lock.is_held());
    }

    #[test]
    fn owner_pid_is_written_to_the_lock_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");
        let mut lock = ProcessLock::new(&path);
        assert!(lock.try_acquire());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn inherited_handle_is_not_ownership() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");

        let mut holder = ProcessLock::new(&path);
        assert!(holder.try_acquire());

        // Simulate a forked child that sees a handle opened by another pid.
        let mut child = ProcessLock::new(&path);
        child.handle = Some(
            OpenOptions::new()
                .write(true)
                .open(&path)
                .unwrap(),
        );
        child.owner_pid = Some(std::process::id().wrapping_add(1));

        assert!(!child.is_held());
        assert!(!child.try_acquire());
        assert!(holder.is_held());
    }

    #[test]
    fn dropping_the_lock_frees_the_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");
        {
            let mut lock = ProcessLock::new(&path);
            assert!(lock.try_acquire());
        }
        let mut next = ProcessLock::new(&path);
        assert!(next.try_acquire());
    }
}
