//! Key and value serializers
//!
//! Typed serialization sits above the byte-keyed store: caches serialize keys
//! and values at the edge and the store below only ever sees bytes.

use crate::errors::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Converts values of one type to and from bytes.
pub trait BinarySerializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// The default serializer: JSON through serde.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BinarySerializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| Error::serialization("", "failed to encode value", e))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::serialization("", "failed to decode value", e))
    }
}

/// How a cache's key or value serializer was chosen.
///
/// Two specs are compatible when both are `Default`, or both are `Custom`
/// and refer to the same serializer object. Asking for the default serializer
/// is expressed as `Default`, never as a fresh `Custom` instance of it.
pub enum SerializerSpec<T> {
    Default,
    Custom(Arc<dyn BinarySerializer<T>>),
}

impl<T> SerializerSpec<T> {
    pub fn is_default(&self) -> bool {
        matches!(self, SerializerSpec::Default)
    }

    /// Whether this spec and `other` name substitutable serializers
    pub fn compatible_with(&self, other: &SerializerSpec<T>) -> bool {
        match (self, other) {
            (SerializerSpec::Default, SerializerSpec::Default) => true,
            (SerializerSpec::Custom(a), SerializerSpec::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T> SerializerSpec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// The serializer this spec names
    pub fn resolve(&self) -> Arc<dyn BinarySerializer<T>> {
        match self {
            SerializerSpec::Default => Arc::new(JsonSerializer::new()),
            SerializerSpec::Custom(serializer) => Arc::clone(serializer),
        }
    }
}

impl<T> Clone for SerializerSpec<T> {
    fn clone(&self) -> Self {
        match self {
            SerializerSpec::Default => SerializerSpec::Default,
            SerializerSpec::Custom(serializer) => SerializerSpec::Custom(Arc::clone(serializer)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer::<Vec<String>>::new();
        let value = vec!["a".to_string(), "b".to_string()];

        let bytes = serializer.serialize(&value).unwrap();
        assert_eq!(serializer.deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn deserializing_garbage_fails() {
        let serializer = JsonSerializer::<u32>::new();
        assert!(serializer.deserialize(b"not json").is_err());
    }

    #[test]
    fn default_specs_are_compatible() {
        let a = SerializerSpec::<String>::Default;
        let b = SerializerSpec::<String>::Default;
        assert!(a.compatible_with(&b));
    }

    #[test]
    fn custom_specs_compare_by_identity() {
        let serializer: Arc<dyn BinarySerializer<String>> = Arc::new(JsonSerializer::new());
        let a = SerializerSpec::Custom(Arc::clone(&serializer));
        let b = SerializerSpec::Custom(Arc::clone(&serializer));
        let c = SerializerSpec::Custom(
            Arc::new(JsonSerializer::new()) as Arc<dyn BinarySerializer<String>>
        );

        assert!(a.compatible_with(&b));
        assert!(!a.compatible_with(&c));
        assert!(!a.compatible_with(&SerializerSpec::Default));
    }
}
