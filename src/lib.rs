//! Multi-process-safe access coordination for on-disk key-value caches
//!
//! A [`CacheAccessCoordinator`] mediates access to an indexed store shared by
//! many cooperating processes and many threads within one process: it holds
//! the inter-process file lock, scopes cache operations inside owner frames,
//! releases the lock when another process signals contention, and reacquires
//! it — after re-running the initialization handshake — when needed again.
//!
//! ```no_run
//! use crosscache::{CacheAccessCoordinator, CacheParameters, LockMode};
//!
//! # fn main() -> crosscache::Result<()> {
//! let coordinator = CacheAccessCoordinator::builder("/var/cache/myapp")
//!     .display_name("myapp")
//!     .lock_mode(LockMode::None)
//!     .build();
//! coordinator.open()?;
//!
//! let sizes = coordinator.new_cache(CacheParameters::<String, u64>::new("artifact-sizes"))?;
//! coordinator.use_cache("record size", || sizes.put(&"libfoo.so".to_string(), &14_336))??;
//!
//! coordinator.close()?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod cache;
pub mod coordinator;
pub mod errors;
pub mod init;
pub mod lock;
pub mod registry;
pub mod serializer;
pub mod store;

pub use access::FileAccess;
pub use cache::{AsyncCacheAccess, CacheDecorator, CrossProcessCacheAccess, MultiProcessSafeCache};
pub use coordinator::{CacheAccessCoordinator, CacheCoordinatorBuilder};
pub use errors::{Error, Result};
pub use init::{InitializationAction, NoInitialization, VersionedStoreInitializer};
pub use lock::{
    ContentionHandler, DefaultFileLockManager, FileLock, FileLockManager, LockMode, OnDiskFileLock,
};
pub use registry::CacheParameters;
pub use serializer::{BinarySerializer, JsonSerializer, SerializerSpec};
pub use store::{DefaultStoreFactory, FileBackedStore, IndexedCache, StoreFactory};
