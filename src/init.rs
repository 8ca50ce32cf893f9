//! Store initialization actions
//!
//! The coordinator asks an [`InitializationAction`] whether the backing store
//! needs to be (re)built before handing it to callers. The action runs inside
//! the crash-safe `write_file` region of an exclusive lock.

use crate::errors::{Error, Result};
use crate::lock::FileLock;
use crate::store::write_atomic;
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Decides whether the on-disk store must be initialized, and does so.
pub trait InitializationAction: Send + Sync {
    /// Whether the store behind `lock` needs initialization
    fn requires_initialization(&self, lock: &dyn FileLock) -> Result<bool>;

    /// Build the store. Called while holding an exclusive lock, inside its
    /// crash-safe write region.
    fn initialize(&self, lock: &dyn FileLock) -> Result<()>;
}

/// An action for stores that never need initialization.
pub struct NoInitialization;

impl InitializationAction for NoInitialization {
    fn requires_initialization(&self, _lock: &dyn FileLock) -> Result<bool> {
        Ok(false)
    }

    fn initialize(&self, _lock: &dyn FileLock) -> Result<()> {
        Ok(())
    }
}

/// Stamps the cache directory with a format version and rebuilds it when the
/// stamp is missing, stale, or the previous holder crashed mid-write.
///
/// A stamp newer than `version` is an error: the store belongs to a newer
/// release and rebuilding it here would corrupt that release's data.
pub struct VersionedStoreInitializer {
    cache_dir: PathBuf,
    version: u32,
}

impl VersionedStoreInitializer {
    pub fn new(cache_dir: impl Into<PathBuf>, version: u32) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            version,
        }
    }

    fn version_file(&self) -> PathBuf {
        self.cache_dir.join("VERSION")
    }
}

impl InitializationAction for VersionedStoreInitializer {
    fn requires_initialization(&self, lock: &dyn FileLock) -> Result<bool> {
        if lock.is_dirty()? {
            return Ok(true);
        }

        let version_file = self.version_file();
        if !version_file.exists() {
            return Ok(true);
        }

        let content = fs::read_to_string(&version_file)
            .map_err(|e| Error::file_system(&version_file, "read version file", e))?;
        match content.trim().parse::<u32>() {
            Ok(found) if found == self.version => Ok(false),
            Ok(found) if found < self.version => Ok(true),
            Ok(found) => Err(Error::initialization(format!(
                "store version {found} is newer than supported version {}",
                self.version
            ))),
            // An unreadable stamp means the store is in an unknown state
            Err(_) => Ok(true),
        }
    }

    fn initialize(&self, _lock: &dyn FileLock) -> Result<()> {
        info!(dir = %self.cache_dir.display(), version = self.version, "initializing cache directory");
        fs::create_dir_all(&self.cache_dir)
            .map_err(|e| Error::file_system(&self.cache_dir, "create cache directory", e))?;
        write_atomic(&self.version_file(), self.version.to_string().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{DefaultFileLockManager, FileLockManager, LockMode};
    use tempfile::TempDir;

    fn exclusive_lock(dir: &TempDir) -> Box<dyn FileLock> {
        DefaultFileLockManager::new()
            .lock(&dir.path().join("store.lock"), LockMode::Exclusive, "test")
            .unwrap()
    }

    #[test]
    fn missing_stamp_requires_initialization() {
        let dir = TempDir::new().unwrap();
        let lock = exclusive_lock(&dir);
        let action = VersionedStoreInitializer::new(dir.path().join("store"), 3);

        assert!(action.requires_initialization(lock.as_ref()).unwrap());
        action.initialize(lock.as_ref()).unwrap();
        assert!(!action.requires_initialization(lock.as_ref()).unwrap());
    }

    #[test]
    fn stale_stamp_requires_initialization() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        fs::create_dir_all(&store_dir).unwrap();
        fs::write(store_dir.join("VERSION"), "2").unwrap();

        let lock = exclusive_lock(&dir);
        let action = VersionedStoreInitializer::new(&store_dir, 3);
        assert!(action.requires_initialization(lock.as_ref()).unwrap());
    }

    #[test]
    fn newer_stamp_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        fs::create_dir_all(&store_dir).unwrap();
        fs::write(store_dir.join("VERSION"), "9").unwrap();

        let lock = exclusive_lock(&dir);
        let action = VersionedStoreInitializer::new(&store_dir, 3);
        assert!(action.requires_initialization(lock.as_ref()).is_err());
    }

    #[test]
    fn garbled_stamp_requires_initialization() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        fs::create_dir_all(&store_dir).unwrap();
        fs::write(store_dir.join("VERSION"), "not a number").unwrap();

        let lock = exclusive_lock(&dir);
        let action = VersionedStoreInitializer::new(&store_dir, 3);
        assert!(action.requires_initialization(lock.as_ref()).unwrap());
    }

    #[test]
    fn dirty_lock_forces_initialization() {
        let dir = TempDir::new().unwrap();
        let lock = exclusive_lock(&dir);
        let store_dir = dir.path().join("store");

        let action = VersionedStoreInitializer::new(&store_dir, 1);
        action.initialize(lock.as_ref()).unwrap();
        assert!(!action.requires_initialization(lock.as_ref()).unwrap());

        // A write region that never finished marks the store suspect
        let _ = lock.write_file(&mut || Err(Error::initialization("interrupted")));
        assert!(action.requires_initialization(lock.as_ref()).unwrap());
    }
}
