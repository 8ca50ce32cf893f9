//! Typed cache facades
//!
//! A [`MultiProcessSafeCache`] serializes keys and values at the edge and
//! forwards bytes to the store below. Every operation requires the calling
//! thread to be the current cache owner, which in turn guarantees the
//! inter-process lock is held.

use crate::errors::{Error, Result};
use crate::lock::LockStateMachine;
use crate::serializer::BinarySerializer;
use crate::store::IndexedCache;
use std::sync::Arc;

/// Runs short critical sections under the file lock on behalf of decorated
/// caches. A view over the coordinator, not a back-pointer.
#[derive(Clone)]
pub struct CrossProcessCacheAccess {
    machine: Arc<LockStateMachine>,
}

impl CrossProcessCacheAccess {
    pub(crate) fn new(machine: Arc<LockStateMachine>) -> Self {
        Self { machine }
    }

    /// Run `action` while holding the file lock and thread ownership
    pub fn with_file_lock<R>(&self, action: impl FnOnce() -> Result<R>) -> Result<R> {
        let _frame = self.machine.use_cache_frame("with_file_lock")?;
        action()
    }
}

/// Read and update entry points for decorated caches. Delivery is
/// synchronous: updates run under ownership before `push_update` returns,
/// and `flush` has nothing left to wait for.
#[derive(Clone)]
pub struct AsyncCacheAccess {
    machine: Arc<LockStateMachine>,
}

impl AsyncCacheAccess {
    pub(crate) fn new(machine: Arc<LockStateMachine>) -> Self {
        Self { machine }
    }

    /// Run a read under ownership
    pub fn read<R>(&self, action: impl FnOnce() -> Result<R>) -> Result<R> {
        let _frame = self.machine.use_cache_frame("async read")?;
        action()
    }

    /// Apply an update under ownership
    pub fn push_update(&self, action: impl FnOnce() -> Result<()>) -> Result<()> {
        let _frame = self.machine.use_cache_frame("async update")?;
        action()
    }

    /// Wait for queued updates to land
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Wraps the byte-level store of a cache, e.g. with an in-memory layer.
///
/// Decorators are compared by identity when a cache name is re-registered:
/// the same decorator object must be supplied on every registration.
pub trait CacheDecorator: Send + Sync {
    fn decorate(
        &self,
        cache_id: u64,
        cache_name: &str,
        store: Arc<dyn IndexedCache>,
        cross_process: CrossProcessCacheAccess,
        async_access: AsyncCacheAccess,
    ) -> Arc<dyn IndexedCache>;
}

/// A typed key→value cache safe to share across threads and processes.
///
/// Operations are only legal inside a `use_cache` frame of the owning
/// coordinator; anywhere else they fail without touching the store.
pub struct MultiProcessSafeCache<K, V> {
    name: String,
    key_serializer: Arc<dyn BinarySerializer<K>>,
    value_serializer: Arc<dyn BinarySerializer<V>>,
    store: Arc<dyn IndexedCache>,
    machine: Arc<LockStateMachine>,
}

impl<K, V> MultiProcessSafeCache<K, V> {
    pub(crate) fn new(
        name: String,
        key_serializer: Arc<dyn BinarySerializer<K>>,
        value_serializer: Arc<dyn BinarySerializer<V>>,
        store: Arc<dyn IndexedCache>,
        machine: Arc<LockStateMachine>,
    ) -> Self {
        Self {
            name,
            key_serializer,
            value_serializer,
            store,
            machine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.machine.with_owned_lock("cache get", |_| {
            let key = self.encode_key(key)?;
            match self.store.get(&key)? {
                Some(bytes) => self.decode_value(&bytes).map(Some),
                None => Ok(None),
            }
        })
    }

    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        self.machine.with_owned_lock("cache put", |_| {
            let key = self.encode_key(key)?;
            let value = self
                .value_serializer
                .serialize(value)
                .map_err(|e| self.in_cache(e))?;
            self.store.put(key, value)
        })
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.machine.with_owned_lock("cache remove", |_| {
            let key = self.encode_key(key)?;
            self.store.remove(&key)
        })
    }

    /// Persist any state the store buffers
    pub fn flush(&self) -> Result<()> {
        self.machine
            .with_owned_lock("cache flush", |_| self.store.flush())
    }

    fn encode_key(&self, key: &K) -> Result<Vec<u8>> {
        self.key_serializer
            .serialize(key)
            .map_err(|e| self.in_cache(e))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<V> {
        self.value_serializer
            .deserialize(bytes)
            .map_err(|e| self.in_cache(e))
    }

    /// Stamp serialization errors with this cache's name
    fn in_cache(&self, error: Error) -> Error {
        match error {
            Error::Serialization {
                message, source, ..
            } => Error::Serialization {
                cache: self.name.clone(),
                message,
                source,
            },
            other => other,
        }
    }
}
