//! Payload codec registry.
//!
//! Envelopes carry their payload as opaque bytes plus a type identifier.
//! Applications register each message type once, under the identifier peers
//! use for it; encoding and decoding then resolve the codec by identifier or
//! by Rust type without any per-message lookup beyond a map hit.

use crate::error::WireError;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::sync::Arc;
use tracing::debug;

type EncodeFn = Box<dyn Fn(&dyn Any) -> Result<Vec<u8>, WireError> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, WireError> + Send + Sync>;

struct PayloadCodec {
    type_name: String,
    rust_type: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Maps type identifiers to encode/decode function pairs.
#[derive(Default)]
pub struct CodecRegistry {
    by_name: DashMap<String, Arc<PayloadCodec>>,
    by_type: DashMap<TypeId, Arc<PayloadCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serde type, encoded as named-field MessagePack.
    pub fn register<T>(&self, type_name: impl Into<String>)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.register_with::<T, _, _>(
            type_name,
            |msg| rmp_serde::to_vec_named(msg).map_err(|e| WireError::Encode(e.to_string())),
            |bytes| rmp_serde::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string())),
        );
    }

    /// Register a type with custom encode/decode functions.
    ///
    /// Re-registering a type name replaces the previous codec.
    pub fn register_with<T, E, D>(&self, type_name: impl Into<String>, encode: E, decode: D)
    where
        T: Send + 'static,
        E: Fn(&T) -> Result<Vec<u8>, WireError> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T, WireError> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        let rust_type = std::any::type_name::<T>();
        let name_for_encode = type_name.clone();

        let codec = Arc::new(PayloadCodec {
            type_name: type_name.clone(),
            rust_type,
            encode: Box::new(move |msg: &dyn Any| match msg.downcast_ref::<T>() {
                Some(msg) => encode(msg),
                None => Err(WireError::TypeMismatch {
                    class_name: name_for_encode.clone(),
                    expected: rust_type,
                }),
            }),
            decode: Box::new(move |bytes: &[u8]| {
                decode(bytes).map(|msg| Box::new(msg) as Box<dyn Any + Send>)
            }),
        });

        debug!(type_name = %type_name, rust_type, "Registered payload codec");
        if let Some(previous) = self.by_type.insert(TypeId::of::<T>(), Arc::clone(&codec)) {
            if previous.type_name != type_name {
                self.by_name.remove(&previous.type_name);
            }
        }
        self.by_name.insert(type_name, codec);
    }

    /// Whether a codec is registered under `type_name`.
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.by_name.contains_key(type_name)
    }

    /// The identifier a Rust type was registered under.
    pub fn type_name_of<T: 'static>(&self) -> Option<String> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|codec| codec.type_name.clone())
    }

    /// Encode a message, returning its type identifier and payload bytes.
    pub fn encode<T: 'static>(&self, message: &T) -> Result<(String, Vec<u8>), WireError> {
        let codec = self
            .by_type
            .get(&TypeId::of::<T>())
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| {
                WireError::UnknownMessageType(std::any::type_name::<T>().to_string())
            })?;
        let bytes = (codec.encode)(message)?;
        Ok((codec.type_name.clone(), bytes))
    }

    /// Decode a payload into a type-erased message.
    pub fn decode_any(
        &self,
        type_name: &str,
        bytes: &[u8],
    ) -> Result<Box<dyn Any + Send>, WireError> {
        let codec = self
            .by_name
            .get(type_name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| WireError::UnknownMessageType(type_name.to_string()))?;
        (codec.decode)(bytes)
    }

    /// Decode a payload into a concrete type.
    pub fn decode<T: 'static>(&self, type_name: &str, bytes: &[u8]) -> Result<T, WireError> {
        let expected = std::any::type_name::<T>();
        let message = self.decode_any(type_name, bytes)?;
        let message: Box<dyn Any> = message;
        message
            .downcast::<T>()
            .map(|m| *m)
            .map_err(|_| WireError::TypeMismatch {
                class_name: type_name.to_string(),
                expected,
            })
    }

    /// Registered type identifiers with the Rust type behind each.
    pub fn registered(&self) -> Vec<(String, &'static str)> {
        self.by_name
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().rust_type))
            .collect()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("types", &self.registered())
            .finish()
    }
}
