//! Byte-keyed indexed stores
//!
//! The coordinator hands caches a store that maps byte keys to byte values;
//! typed serialization happens above this layer. [`FileBackedStore`] is the
//! default implementation: one JSON file per cache, rewritten atomically, with
//! staleness detection so changes written by the last lock holder are picked
//! up after a reacquire.

use crate::errors::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::trace;

/// An indexed key→value store backed by one file.
pub trait IndexedCache: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;
    fn remove(&self, key: &[u8]) -> Result<()>;

    /// Persist any buffered state. Write-through implementations may no-op.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Produces the byte-level store behind a cache.
pub trait StoreFactory: Send + Sync {
    fn create(&self, file: &Path, cache_name: &str) -> Result<Arc<dyn IndexedCache>>;
}

/// The default factory: a [`FileBackedStore`] per cache.
pub struct DefaultStoreFactory;

impl StoreFactory for DefaultStoreFactory {
    fn create(&self, file: &Path, cache_name: &str) -> Result<Arc<dyn IndexedCache>> {
        trace!(cache = cache_name, file = %file.display(), "creating file-backed store");
        Ok(Arc::new(FileBackedStore::new(file)))
    }
}

/// Write `bytes` to `path` through a same-directory temporary file and an
/// atomic rename, so readers never observe a partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| {
            Error::file_system(
                path,
                "resolve parent directory",
                std::io::Error::new(std::io::ErrorKind::Other, "path has no parent"),
            )
        })?;
    fs::create_dir_all(parent).map_err(|e| Error::file_system(parent, "create directory", e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let tmp_path = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));

    let mut tmp = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| Error::file_system(&tmp_path, "create temporary file", e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.sync_all())
        .map_err(|e| Error::file_system(&tmp_path, "write temporary file", e))?;
    drop(tmp);

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        Error::file_system(path, "replace file", e)
    })
}

/// Identity of one on-disk version of the store file
#[derive(PartialEq, Eq, Clone, Copy)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Option<FileStamp>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(FileStamp {
                len: meta.len(),
                modified: meta.modified().ok(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::file_system(path, "stat store file", e)),
        }
    }
}

struct StoreState {
    entries: HashMap<Vec<u8>, Vec<u8>>,
    loaded: Option<Option<FileStamp>>,
}

/// A write-through store persisted as a JSON list of key/value byte pairs.
///
/// Each mutation rewrites the whole file, which keeps crash behavior trivial
/// at the cost of throughput. Every operation re-stats the file and reloads
/// when another process changed it since the last look.
pub struct FileBackedStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileBackedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(StoreState {
                entries: HashMap::new(),
                loaded: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_fresh(&self, state: &mut StoreState) -> Result<()> {
        let on_disk = FileStamp::of(&self.path)?;
        if state.loaded == Some(on_disk) {
            return Ok(());
        }

        state.entries = match &on_disk {
            None => HashMap::new(),
            Some(_) => {
                let file = File::open(&self.path)
                    .map_err(|e| Error::file_system(&self.path, "open store file", e))?;
                let pairs: Vec<(Vec<u8>, Vec<u8>)> = serde_json::from_reader(file)
                    .map_err(|e| Error::serialization("", "store file is corrupt", e))?;
                pairs.into_iter().collect()
            }
        };
        state.loaded = Some(on_disk);
        Ok(())
    }

    fn persist(&self, state: &mut StoreState) -> Result<()> {
        let pairs: Vec<(&Vec<u8>, &Vec<u8>)> = state.entries.iter().collect();
        let bytes = serde_json::to_vec(&pairs)
            .map_err(|e| Error::serialization("", "failed to encode store file", e))?;
        write_atomic(&self.path, &bytes)?;
        state.loaded = Some(FileStamp::of(&self.path)?);
        Ok(())
    }
}

impl IndexedCache for FileBackedStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        self.ensure_fresh(&mut state)?;
        Ok(state.entries.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_fresh(&mut state)?;
        state.entries.insert(key, value);
        self.persist(&mut state)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_fresh(&mut state)?;
        if state.entries.remove(key).is_some() {
            self.persist(&mut state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_remove_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileBackedStore::new(dir.path().join("data.cache"));

        assert_eq!(store.get(b"missing").unwrap(), None);
        store.put(b"key".to_vec(), b"value".to_vec()).unwrap();
        assert_eq!(store.get(b"key").unwrap(), Some(b"value".to_vec()));

        store.remove(b"key").unwrap();
        assert_eq!(store.get(b"key").unwrap(), None);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.cache");

        let store = FileBackedStore::new(&path);
        store.put(b"key".to_vec(), b"value".to_vec()).unwrap();
        drop(store);

        let store = FileBackedStore::new(&path);
        assert_eq!(store.get(b"key").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn external_changes_are_picked_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.cache");

        let writer = FileBackedStore::new(&path);
        let reader = FileBackedStore::new(&path);

        writer.put(b"key".to_vec(), b"first".to_vec()).unwrap();
        assert_eq!(reader.get(b"key").unwrap(), Some(b"first".to_vec()));

        // Rewrite through an unrelated handle, as another process would
        writer.put(b"key".to_vec(), b"second".to_vec()).unwrap();
        assert_eq!(reader.get(b"key").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn removing_a_missing_key_does_not_touch_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.cache");

        let store = FileBackedStore::new(&path);
        store.remove(b"missing").unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.cache");
        fs::write(&path, b"not json").unwrap();

        let store = FileBackedStore::new(&path);
        assert!(store.get(b"key").is_err());
    }
}
