//! Default lock manager backed by OS advisory file locks

use crate::errors::{Error, Result};
use crate::lock::{ContentionHandler, FileLock, FileLockManager, LockMode};
use fs2::FileExt;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const MARKER_CLEAN: u8 = 0;
const MARKER_DIRTY: u8 = 1;

/// A lock on one file, acquired through [`DefaultFileLockManager`].
///
/// The first byte of the lock file records whether the previous holder
/// finished its last `write_file` region; everything else about the file is
/// opaque.
pub struct OnDiskFileLock {
    path: PathBuf,
    display_name: String,
    mode: LockMode,
    file: Mutex<Option<File>>,
}

impl OnDiskFileLock {
    fn with_file<R>(&self, operation: &'static str, f: impl FnOnce(&File) -> Result<R>) -> Result<R> {
        let guard = self.file.lock();
        match guard.as_ref() {
            Some(file) => f(file),
            None => Err(Error::lock_manager(
                &self.path,
                format!("cannot {operation}: the lock was already closed"),
            )),
        }
    }

    fn write_marker(&self, file: &File, marker: u8) -> Result<()> {
        let mut handle = file;
        handle
            .seek(SeekFrom::Start(0))
            .and_then(|_| handle.write_all(&[marker]))
            .and_then(|_| file.sync_data())
            .map_err(|e| Error::file_system(&self.path, "update lock marker", e))
    }

    fn require_exclusive(&self, operation: &'static str) -> Result<()> {
        if self.mode != LockMode::Exclusive {
            return Err(Error::lock_manager(
                &self.path,
                format!("{operation} requires an exclusive lock (held: {})", self.mode),
            ));
        }
        Ok(())
    }
}

impl FileLock for OnDiskFileLock {
    fn mode(&self) -> LockMode {
        self.mode
    }

    fn lock_file(&self) -> &Path {
        &self.path
    }

    fn read_file(&self, action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.with_file("read_file", |_| action())
    }

    fn update_file(&self, action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.require_exclusive("update_file")?;
        self.with_file("update_file", |_| action())
    }

    fn write_file(&self, action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.require_exclusive("write_file")?;
        self.with_file("write_file", |file| {
            self.write_marker(file, MARKER_DIRTY)?;
            action()?;
            self.write_marker(file, MARKER_CLEAN)
        })
    }

    fn is_dirty(&self) -> Result<bool> {
        self.with_file("is_dirty", |file| {
            let mut handle = file;
            let mut marker = [MARKER_CLEAN];
            handle
                .seek(SeekFrom::Start(0))
                .map_err(|e| Error::file_system(&self.path, "read lock marker", e))?;
            match handle.read(&mut marker) {
                // A zero-length lock file was never written through; treat as clean
                Ok(0) => Ok(false),
                Ok(_) => Ok(marker[0] == MARKER_DIRTY),
                Err(e) => Err(Error::file_system(&self.path, "read lock marker", e)),
            }
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.file.lock();
        if let Some(file) = guard.take() {
            trace!(lock = %self.display_name, "releasing file lock");
            FileExt::unlock(&file)
                .map_err(|e| Error::file_system(&self.path, "release lock", e))?;
        }
        Ok(())
    }
}

impl Drop for OnDiskFileLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.lock().take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(lock = %self.display_name, error = %e, "failed to release file lock on drop");
            }
        }
    }
}

/// Lock manager backed by `fs2` advisory locks.
///
/// Acquisition retries with bounded exponential backoff and jitter until the
/// lock is free or the timeout elapses. Contention handlers are recorded so
/// integrations that detect contention out of band can trigger them; the
/// manager itself performs no cross-process signalling.
pub struct DefaultFileLockManager {
    timeout: Duration,
    handlers: Mutex<HashMap<PathBuf, ContentionHandler>>,
}

impl DefaultFileLockManager {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(60))
    }

    /// Create a manager that gives up on acquisition after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// The handler registered for `lock_file`, if any
    pub fn contention_handler(&self, lock_file: &Path) -> Option<ContentionHandler> {
        self.handlers.lock().get(lock_file).cloned()
    }

    fn try_lock(file: &File, mode: LockMode) -> std::io::Result<()> {
        match mode {
            LockMode::Shared => FileExt::try_lock_shared(file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(file),
            LockMode::None => unreachable!("acquisition is never requested in none mode"),
        }
    }
}

impl Default for DefaultFileLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileLockManager for DefaultFileLockManager {
    fn lock(
        &self,
        lock_file: &Path,
        mode: LockMode,
        display_name: &str,
    ) -> Result<Box<dyn FileLock>> {
        if mode == LockMode::None {
            return Err(Error::lock_manager(
                lock_file,
                "a lock cannot be acquired in none mode",
            ));
        }

        if let Some(parent) = lock_file.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::file_system(parent, "create lock directory", e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_file)
            .map_err(|e| Error::file_system(lock_file, "open lock file", e))?;

        let start = Instant::now();
        let mut backoff_ms = 10u64;
        const MAX_BACKOFF_MS: u64 = 1000;

        loop {
            match Self::try_lock(&file, mode) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() > self.timeout {
                        return Err(Error::lock_manager(
                            lock_file,
                            format!(
                                "timeout waiting for {mode} lock on '{display_name}' (waited {:?})",
                                self.timeout
                            ),
                        ));
                    }

                    // Exponential backoff with jitter
                    let jitter = backoff_ms / 4;
                    let sleep_ms = backoff_ms + rand::thread_rng().gen_range(0..=jitter);
                    std::thread::sleep(Duration::from_millis(sleep_ms));
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
                Err(e) => {
                    return Err(Error::lock_manager_with_source(
                        lock_file,
                        format!("failed to acquire {mode} lock on '{display_name}'"),
                        e,
                    ));
                }
            }
        }

        debug!(lock = display_name, %mode, "acquired file lock");
        Ok(Box::new(OnDiskFileLock {
            path: lock_file.to_path_buf(),
            display_name: display_name.to_string(),
            mode,
            file: Mutex::new(Some(file)),
        }))
    }

    fn allow_contention(&self, lock: &dyn FileLock, handler: ContentionHandler) {
        self.handlers
            .lock()
            .insert(lock.lock_file().to_path_buf(), handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> DefaultFileLockManager {
        DefaultFileLockManager::with_timeout(Duration::from_millis(200))
    }

    #[test]
    fn exclusive_lock_excludes_other_holders() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.lock");

        let first = manager().lock(&path, LockMode::Exclusive, "test").unwrap();
        assert!(manager().lock(&path, LockMode::Exclusive, "test").is_err());

        first.close().unwrap();
        let second = manager().lock(&path, LockMode::Exclusive, "test").unwrap();
        second.close().unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.lock");

        let first = manager().lock(&path, LockMode::Shared, "test").unwrap();
        let second = manager().lock(&path, LockMode::Shared, "test").unwrap();
        assert!(manager().lock(&path, LockMode::Exclusive, "test").is_err());

        first.close().unwrap();
        second.close().unwrap();
    }

    #[test]
    fn write_file_requires_exclusive_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.lock");

        let lock = manager().lock(&path, LockMode::Shared, "test").unwrap();
        let result = lock.write_file(&mut || Ok(()));
        assert!(result.is_err());
        lock.close().unwrap();
    }

    #[test]
    fn interrupted_write_region_leaves_dirty_marker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.lock");

        let lock = manager().lock(&path, LockMode::Exclusive, "test").unwrap();
        let result = lock.write_file(&mut || Err(Error::initialization("boom")));
        assert!(result.is_err());
        assert!(lock.is_dirty().unwrap());
        lock.close().unwrap();

        // The marker survives into the next acquisition
        let lock = manager().lock(&path, LockMode::Exclusive, "test").unwrap();
        assert!(lock.is_dirty().unwrap());
        lock.write_file(&mut || Ok(())).unwrap();
        assert!(!lock.is_dirty().unwrap());
        lock.close().unwrap();
    }

    #[test]
    fn fresh_lock_file_is_clean() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.lock");

        let lock = manager().lock(&path, LockMode::Exclusive, "test").unwrap();
        assert!(!lock.is_dirty().unwrap());
        lock.close().unwrap();
    }

    #[test]
    fn closed_lock_rejects_file_operations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.lock");

        let lock = manager().lock(&path, LockMode::Exclusive, "test").unwrap();
        lock.close().unwrap();
        assert!(lock.update_file(&mut || Ok(())).is_err());
    }
}
