//! The payload type registry: `type_id -> (serialize, deserialize)`.
//!
//! Application code registers each payload type once at startup, then
//! serializes and deserializes by numeric id. The registry is an ordinary
//! value: build one, wrap it in an `Arc`, and hand it to the hosts that
//! need it. There is no process-wide instance.
//!
//! ```rust
//! use meshlink_protocol::{JsonCodec, TypeRegistry};
//!
//! let registry = TypeRegistry::new();
//! registry.register_codec::<String, _>(100, JsonCodec).unwrap();
//!
//! let bytes = registry.serialize(100, &"hello".to_string()).unwrap();
//! let back: String = registry.deserialize(100, &bytes).unwrap();
//! assert_eq!(back, "hello");
//! ```

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Codec, ProtocolError, RegistryError};

type SerializeFn<T> =
    Box<dyn Fn(&T) -> Result<Vec<u8>, ProtocolError> + Send + Sync>;
type DeserializeFn<T> =
    Box<dyn Fn(&[u8]) -> Result<T, ProtocolError> + Send + Sync>;

/// The serialize/deserialize pair bound to one id, for one concrete `T`.
struct Binding<T> {
    serialize: SerializeFn<T>,
    deserialize: DeserializeFn<T>,
}

/// A registry slot. The binding is stored type-erased; lookups downcast the
/// *binding* back to `Binding<T>`, never the payload value.
struct Entry {
    type_name: &'static str,
    binding: Arc<dyn Any + Send + Sync>,
}

/// Maps numeric type ids to serializer bindings.
///
/// Write-once per id, read-many. Reads take a shared lock only long enough
/// to clone the binding out; the (de)serialize call itself runs unlocked.
#[derive(Default)]
pub struct TypeRegistry {
    entries: RwLock<HashMap<u32, Entry>>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `type_id` to a serialize/deserialize pair for `T`.
    ///
    /// # Errors
    /// Returns [`RegistryError::DuplicateType`] if `type_id` is already bound.
    pub fn register<T, S, D>(
        &self,
        type_id: u32,
        serialize: S,
        deserialize: D,
    ) -> Result<(), RegistryError>
    where
        T: 'static,
        S: Fn(&T) -> Result<Vec<u8>, ProtocolError> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T, ProtocolError> + Send + Sync + 'static,
    {
        let mut entries =
            self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&type_id) {
            return Err(RegistryError::DuplicateType(type_id));
        }

        let binding: Binding<T> = Binding {
            serialize: Box::new(serialize),
            deserialize: Box::new(deserialize),
        };
        entries.insert(
            type_id,
            Entry {
                type_name: type_name::<T>(),
                binding: Arc::new(binding),
            },
        );

        tracing::debug!(type_id, type_name = type_name::<T>(), "payload type registered");
        Ok(())
    }

    /// Binds `type_id` to `T` using a serde [`Codec`].
    pub fn register_codec<T, C>(
        &self,
        type_id: u32,
        codec: C,
    ) -> Result<(), RegistryError>
    where
        T: Serialize + DeserializeOwned + 'static,
        C: Codec,
    {
        let encoder = codec.clone();
        self.register::<T, _, _>(
            type_id,
            move |value| encoder.encode(value),
            move |bytes| codec.decode(bytes),
        )
    }

    /// Serializes `value` with the binding registered under `type_id`.
    ///
    /// # Errors
    /// - [`RegistryError::UnknownType`] if nothing is registered.
    /// - [`RegistryError::TypeMismatch`] if the id is bound to another type.
    /// - [`RegistryError::Encode`] if the bound serializer fails.
    pub fn serialize<T: 'static>(
        &self,
        type_id: u32,
        value: &T,
    ) -> Result<Bytes, RegistryError> {
        let binding = self.lookup::<T>(type_id)?;
        let bytes = (binding.serialize)(value)
            .map_err(|source| RegistryError::Encode { type_id, source })?;
        Ok(Bytes::from(bytes))
    }

    /// Deserializes `bytes` with the binding registered under `type_id`.
    pub fn deserialize<T: 'static>(
        &self,
        type_id: u32,
        bytes: &[u8],
    ) -> Result<T, RegistryError> {
        let binding = self.lookup::<T>(type_id)?;
        (binding.deserialize)(bytes)
            .map_err(|source| RegistryError::Decode { type_id, source })
    }

    /// Returns `true` if `type_id` is bound.
    pub fn contains(&self, type_id: u32) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&type_id)
    }

    /// The Rust type name bound to `type_id`, for diagnostics.
    pub fn type_name(&self, type_id: u32) -> Option<&'static str> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .map(|entry| entry.type_name)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup<T: 'static>(
        &self,
        type_id: u32,
    ) -> Result<Arc<Binding<T>>, RegistryError> {
        let entries =
            self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get(&type_id)
            .ok_or(RegistryError::UnknownType(type_id))?;

        Arc::clone(&entry.binding)
            .downcast::<Binding<T>>()
            .map_err(|_| RegistryError::TypeMismatch {
                type_id,
                registered: entry.type_name,
                requested: type_name::<T>(),
            })
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries =
            self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = entries.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("TypeRegistry").field("type_ids", &ids).finish()
    }
}
