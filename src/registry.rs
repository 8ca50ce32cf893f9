//! Cache registry
//!
//! Maps cache names to their parameters and the facade built for them. A name
//! registered once pins its parameters: later registrations must be
//! compatible and receive the same facade object.

use crate::cache::{CacheDecorator, MultiProcessSafeCache};
use crate::errors::{Error, Result};
use crate::serializer::SerializerSpec;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Everything that identifies a typed cache within a coordinator.
pub struct CacheParameters<K, V> {
    name: String,
    key_serializer: SerializerSpec<K>,
    value_serializer: SerializerSpec<V>,
    decorator: Option<Arc<dyn CacheDecorator>>,
}

impl<K, V> CacheParameters<K, V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_serializer: SerializerSpec::Default,
            value_serializer: SerializerSpec::Default,
            decorator: None,
        }
    }

    pub fn with_key_serializer(mut self, spec: SerializerSpec<K>) -> Self {
        self.key_serializer = spec;
        self
    }

    pub fn with_value_serializer(mut self, spec: SerializerSpec<V>) -> Self {
        self.value_serializer = spec;
        self
    }

    pub fn with_decorator(mut self, decorator: Arc<dyn CacheDecorator>) -> Self {
        self.decorator = Some(decorator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_serializer(&self) -> &SerializerSpec<K> {
        &self.key_serializer
    }

    pub fn value_serializer(&self) -> &SerializerSpec<V> {
        &self.value_serializer
    }

    pub fn decorator(&self) -> Option<&Arc<dyn CacheDecorator>> {
        self.decorator.as_ref()
    }

    /// Why `requested` cannot reuse the cache registered with these
    /// parameters, if anything
    fn reuse_conflict(&self, requested: &CacheParameters<K, V>) -> Option<String> {
        if !self.key_serializer.compatible_with(&requested.key_serializer) {
            return Some("key serializers differ".to_string());
        }
        if !self
            .value_serializer
            .compatible_with(&requested.value_serializer)
        {
            return Some("value serializers differ".to_string());
        }
        let decorators_match = match (&self.decorator, &requested.decorator) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if !decorators_match {
            return Some("decorators differ".to_string());
        }
        None
    }
}

struct CacheEntry {
    key_type_name: &'static str,
    value_type_name: &'static str,
    params: Box<dyn Any + Send + Sync>,
    built: Arc<dyn Any + Send + Sync>,
}

/// The per-coordinator table of registered caches
pub(crate) struct CacheRegistry {
    caches: HashMap<String, CacheEntry>,
    next_id: u64,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self {
            caches: HashMap::new(),
            next_id: 0,
        }
    }

    /// Return the cache registered under `params.name()`, building it through
    /// `build` on first registration. Incompatible parameters for an existing
    /// name fail and leave the registry unchanged.
    pub fn get_or_build<K, V>(
        &mut self,
        params: CacheParameters<K, V>,
        build: impl FnOnce(u64, &CacheParameters<K, V>) -> Result<MultiProcessSafeCache<K, V>>,
    ) -> Result<Arc<MultiProcessSafeCache<K, V>>>
    where
        K: Serialize + DeserializeOwned + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if let Some(entry) = self.caches.get(params.name()) {
            let existing = entry
                .params
                .downcast_ref::<CacheParameters<K, V>>()
                .ok_or_else(|| {
                    Error::invalid_cache_reuse(
                        params.name(),
                        format!(
                            "registered for {} -> {}, requested {} -> {}",
                            entry.key_type_name,
                            entry.value_type_name,
                            std::any::type_name::<K>(),
                            std::any::type_name::<V>()
                        ),
                    )
                })?;
            if let Some(conflict) = existing.reuse_conflict(&params) {
                return Err(Error::invalid_cache_reuse(params.name(), conflict));
            }
            let built = match Arc::clone(&entry.built).downcast::<MultiProcessSafeCache<K, V>>() {
                Ok(built) => built,
                Err(_) => unreachable!("entry type verified against its parameters"),
            };
            return Ok(built);
        }

        let id = self.next_id;
        self.next_id += 1;
        debug!(cache = params.name(), id, "registering cache");
        let built = Arc::new(build(id, &params)?);
        self.caches.insert(
            params.name().to_string(),
            CacheEntry {
                key_type_name: std::any::type_name::<K>(),
                value_type_name: std::any::type_name::<V>(),
                params: Box::new(params),
                built: built.clone() as Arc<dyn Any + Send + Sync>,
            },
        );
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::NoInitialization;
    use crate::lock::{
        ContentionHandler, FileLock, FileLockManager, LockMode, LockStateMachine,
    };
    use crate::serializer::{BinarySerializer, JsonSerializer};
    use crate::store::{FileBackedStore, IndexedCache};
    use std::path::Path;

    struct NeverLocks;

    impl FileLockManager for NeverLocks {
        fn lock(
            &self,
            lock_file: &Path,
            _mode: LockMode,
            _display_name: &str,
        ) -> crate::errors::Result<Box<dyn FileLock>> {
            Err(Error::lock_manager(lock_file, "not expected in this test"))
        }

        fn allow_contention(&self, _lock: &dyn FileLock, _handler: ContentionHandler) {}
    }

    fn build_cache<K, V>(
        params: &CacheParameters<K, V>,
        dir: &Path,
    ) -> Result<MultiProcessSafeCache<K, V>>
    where
        K: Serialize + DeserializeOwned + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let machine = LockStateMachine::new(
            Arc::new(NeverLocks),
            Arc::new(NoInitialization),
            dir.join("store.lock"),
            "test".to_string(),
            LockMode::None,
        );
        let store: Arc<dyn IndexedCache> =
            Arc::new(FileBackedStore::new(dir.join(format!("{}.cache", params.name()))));
        Ok(MultiProcessSafeCache::new(
            params.name().to_string(),
            params.key_serializer().resolve(),
            params.value_serializer().resolve(),
            store,
            machine,
        ))
    }

    #[test]
    fn same_params_return_the_same_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut registry = CacheRegistry::new();

        let first = registry
            .get_or_build(CacheParameters::<String, u32>::new("hits"), |_, p| {
                build_cache(p, dir.path())
            })
            .unwrap();
        let second = registry
            .get_or_build(CacheParameters::<String, u32>::new("hits"), |_, _| {
                panic!("must not rebuild a registered cache")
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn changed_value_type_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut registry = CacheRegistry::new();

        registry
            .get_or_build(CacheParameters::<String, u32>::new("hits"), |_, p| {
                build_cache(p, dir.path())
            })
            .unwrap();

        let result = registry.get_or_build(
            CacheParameters::<String, String>::new("hits"),
            |_, p| build_cache(p, dir.path()),
        );
        assert!(matches!(result, Err(Error::InvalidCacheReuse { .. })));

        // The original registration is untouched
        let again = registry
            .get_or_build(CacheParameters::<String, u32>::new("hits"), |_, _| {
                panic!("must not rebuild a registered cache")
            })
            .unwrap();
        assert_eq!(again.name(), "hits");
    }

    #[test]
    fn changed_serializer_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut registry = CacheRegistry::new();

        registry
            .get_or_build(CacheParameters::<String, u32>::new("hits"), |_, p| {
                build_cache(p, dir.path())
            })
            .unwrap();

        let custom: Arc<dyn BinarySerializer<String>> = Arc::new(JsonSerializer::new());
        let result = registry.get_or_build(
            CacheParameters::<String, u32>::new("hits")
                .with_key_serializer(SerializerSpec::Custom(custom)),
            |_, p| build_cache(p, dir.path()),
        );
        assert!(matches!(result, Err(Error::InvalidCacheReuse { .. })));
    }

    #[test]
    fn identical_custom_serializer_is_compatible() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut registry = CacheRegistry::new();
        let custom: Arc<dyn BinarySerializer<String>> = Arc::new(JsonSerializer::new());

        let first = registry
            .get_or_build(
                CacheParameters::<String, u32>::new("hits")
                    .with_key_serializer(SerializerSpec::Custom(Arc::clone(&custom))),
                |_, p| build_cache(p, dir.path()),
            )
            .unwrap();
        let second = registry
            .get_or_build(
                CacheParameters::<String, u32>::new("hits")
                    .with_key_serializer(SerializerSpec::Custom(custom)),
                |_, _| panic!("must not rebuild a registered cache"),
            )
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn distinct_names_build_distinct_caches() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut registry = CacheRegistry::new();

        let hits = registry
            .get_or_build(CacheParameters::<String, u32>::new("hits"), |_, p| {
                build_cache(p, dir.path())
            })
            .unwrap();
        let misses = registry
            .get_or_build(CacheParameters::<String, u32>::new("misses"), |_, p| {
                build_cache(p, dir.path())
            })
            .unwrap();

        assert_eq!(hits.name(), "hits");
        assert_eq!(misses.name(), "misses");
    }
}
