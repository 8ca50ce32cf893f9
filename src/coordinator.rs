//! Cache access coordination
//!
//! [`CacheAccessCoordinator`] is the entry point of the crate: it opens the
//! on-disk store under the configured lock mode, hands out typed caches, and
//! scopes every cache operation inside a use-cache frame so exactly one
//! thread in this process acts as the cache owner at any instant.

use crate::access::FileAccess;
use crate::cache::{AsyncCacheAccess, CrossProcessCacheAccess, MultiProcessSafeCache};
use crate::errors::Result;
use crate::init::{InitializationAction, NoInitialization};
use crate::lock::{ContentionHandler, DefaultFileLockManager, FileLockManager, LockMode, LockStateMachine};
use crate::registry::{CacheParameters, CacheRegistry};
use crate::store::{DefaultStoreFactory, StoreFactory};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{trace, warn};

/// Coordinates multi-process and multi-thread access to the caches under one
/// directory.
///
/// Created through [`CacheCoordinatorBuilder`]. The coordinator starts
/// closed; [`open`](Self::open) acquires the configured lock (or nothing in
/// [`LockMode::None`]) and [`close`](Self::close) returns it.
pub struct CacheAccessCoordinator {
    machine: Arc<LockStateMachine>,
    registry: Mutex<CacheRegistry>,
    store_factory: Arc<dyn StoreFactory>,
    base_dir: PathBuf,
}

impl CacheAccessCoordinator {
    /// Start configuring a coordinator for the caches under `base_dir`
    pub fn builder(base_dir: impl Into<PathBuf>) -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder::new(base_dir)
    }

    /// Open the coordinator. Fails when already open. In shared or exclusive
    /// mode this acquires the lock and runs the initialization handshake; in
    /// none mode the lock is acquired lazily by the first use-cache frame.
    pub fn open(&self) -> Result<()> {
        self.machine.open()
    }

    /// Close the coordinator, releasing any held lock. Blocks until no
    /// thread owns a use-cache frame; calling it from inside one fails with
    /// [`Error::CacheInUse`](crate::errors::Error::CacheInUse). Contention
    /// signals arriving after this point are discarded. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.machine.close()
    }

    /// Run `action` as the cache owner. Acquires an exclusive lock if none is
    /// held, blocks while another thread owns, and is reentrant on the owner
    /// thread. The lock stays held when the frame ends.
    pub fn use_cache<R>(&self, operation: &str, action: impl FnOnce() -> R) -> Result<R> {
        let _frame = self.machine.use_cache_frame(operation)?;
        trace!(operation, "running cache operation");
        Ok(action())
    }

    /// Run `action` with ownership relinquished, so contending processes can
    /// take the lock while it runs. Outside a use-cache frame this is a plain
    /// call. Ownership (and the lock, if it was surrendered) is restored
    /// before returning.
    pub fn long_running_operation<R>(
        &self,
        operation: &str,
        action: impl FnOnce() -> R,
    ) -> Result<R> {
        let saved = match self.machine.enter_long_running()? {
            Some(saved) => saved,
            None => {
                trace!(operation, "long-running operation outside a use-cache frame");
                return Ok(action());
            }
        };
        trace!(operation, "ownership relinquished for long-running operation");

        let mut restore = RestoreOwnership {
            machine: &self.machine,
            saved: Some(saved),
        };
        let value = action();
        restore.finish()?;
        Ok(value)
    }

    /// Return the cache registered under `params`, building it on first
    /// registration. Construction never acquires the lock.
    pub fn new_cache<K, V>(
        &self,
        params: CacheParameters<K, V>,
    ) -> Result<Arc<MultiProcessSafeCache<K, V>>>
    where
        K: Serialize + DeserializeOwned + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        registry.get_or_build(params, |id, params| {
            let file = self.base_dir.join(format!("{}.cache", params.name()));
            let store = self.store_factory.create(&file, params.name())?;
            let store = match params.decorator() {
                Some(decorator) => decorator.decorate(
                    id,
                    params.name(),
                    store,
                    CrossProcessCacheAccess::new(Arc::clone(&self.machine)),
                    AsyncCacheAccess::new(Arc::clone(&self.machine)),
                ),
                None => store,
            };
            Ok(MultiProcessSafeCache::new(
                params.name().to_string(),
                params.key_serializer().resolve(),
                params.value_serializer().resolve(),
                store,
                Arc::clone(&self.machine),
            ))
        })
    }

    /// Owner-checked access to the held lock's file operations
    pub fn file_access(&self) -> FileAccess {
        FileAccess::new(Arc::clone(&self.machine))
    }

    /// The handler the lock manager's platform invokes when another process
    /// wants the lock
    pub fn when_contended(&self) -> ContentionHandler {
        self.machine.contention_handler()
    }
}

impl Drop for CacheAccessCoordinator {
    fn drop(&mut self) {
        if let Err(e) = self.machine.close() {
            warn!(error = %e, "failed to close cache coordinator on drop");
        }
    }
}

/// Restores relinquished ownership when a long-running action unwinds
struct RestoreOwnership<'a> {
    machine: &'a Arc<LockStateMachine>,
    saved: Option<crate::lock::SavedOwnership>,
}

impl RestoreOwnership<'_> {
    fn finish(&mut self) -> Result<()> {
        match self.saved.take() {
            Some(saved) => self.machine.exit_long_running(saved),
            None => Ok(()),
        }
    }
}

impl Drop for RestoreOwnership<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = self.machine.exit_long_running(saved) {
                warn!(error = %e, "failed to restore ownership after a long-running operation");
            }
        }
    }
}

/// Configures and builds a [`CacheAccessCoordinator`].
pub struct CacheCoordinatorBuilder {
    base_dir: PathBuf,
    display_name: Option<String>,
    lock_mode: LockMode,
    lock_manager: Option<Arc<dyn FileLockManager>>,
    initializer: Option<Arc<dyn InitializationAction>>,
    store_factory: Option<Arc<dyn StoreFactory>>,
}

impl CacheCoordinatorBuilder {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            display_name: None,
            lock_mode: LockMode::None,
            lock_manager: None,
            initializer: None,
            store_factory: None,
        }
    }

    /// Human-readable name used in logs and lock diagnostics
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// The lock mode `open` uses. Defaults to [`LockMode::None`].
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Replace the default `fs2`-backed lock manager
    pub fn lock_manager(mut self, manager: Arc<dyn FileLockManager>) -> Self {
        self.lock_manager = Some(manager);
        self
    }

    /// The action consulted during the initialization handshake. Defaults to
    /// an action that never initializes.
    pub fn initializer(mut self, initializer: Arc<dyn InitializationAction>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// Replace the default file-backed store factory
    pub fn store_factory(mut self, factory: Arc<dyn StoreFactory>) -> Self {
        self.store_factory = Some(factory);
        self
    }

    pub fn build(self) -> CacheAccessCoordinator {
        let display_name = self.display_name.unwrap_or_else(|| {
            self.base_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "cache".to_string())
        });
        let machine = LockStateMachine::new(
            self.lock_manager
                .unwrap_or_else(|| Arc::new(DefaultFileLockManager::new())),
            self.initializer.unwrap_or_else(|| Arc::new(NoInitialization)),
            self.base_dir.join("cache.lock"),
            display_name,
            self.lock_mode,
        );
        CacheAccessCoordinator {
            machine,
            registry: Mutex::new(CacheRegistry::new()),
            store_factory: self
                .store_factory
                .unwrap_or_else(|| Arc::new(DefaultStoreFactory)),
            base_dir: self.base_dir,
        }
    }
}
