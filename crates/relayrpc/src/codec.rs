//! # Codec Registry
//!
//! Pluggable encoders/decoders for application types the structural encoder
//! knows nothing about. A codec is looked up by the concrete type of a
//! [`CustomValue`] on the way out, and by its name (the envelope's `_rtype`)
//! on the way in.

use std::any::Any;
use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;

use crate::envelope::BUILTIN_TAGS;
use crate::error::Result;
use crate::error::RpcError;
use crate::value::CustomValue;
use crate::value::Value;

type EncodeFn = Arc<dyn Fn(&CustomValue) -> Result<Value> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// A named encoder/decoder pair for one concrete Rust type.
#[derive(Clone)]
pub struct Codec {
    name: String,
    type_id: TypeId,
    encoder: Option<EncodeFn>,
    decoder: Option<DecodeFn>,
}

impl Codec {
    /// Starts a codec for `T`. Without an encoder the type stays
    /// unsupported on the way out; without a decoder incoming envelopes
    /// decode as plain maps.
    pub fn new<T: Any + Send + Sync>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            encoder: None,
            decoder: None,
        }
    }

    /// Sets the function turning a `T` into an encodable value.
    pub fn encoder<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> Result<Value> + Send + Sync + 'static,
    {
        let name = self.name.clone();
        self.encoder = Some(Arc::new(move |custom: &CustomValue| match custom.downcast_ref::<T>() {
            Some(v) => f(v),
            None => Err(RpcError::Codec(format!(
                "codec {} cannot encode {}",
                name,
                custom.type_name()
            ))),
        }));
        self
    }

    /// Sets the function rebuilding a value from its decoded encoded form.
    pub fn decoder<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.decoder = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn encode(&self, value: &CustomValue) -> Option<Result<Value>> {
        self.encoder.as_ref().map(|f| f(value))
    }

    pub(crate) fn decode(&self, value: Value) -> Option<Result<Value>> {
        self.decoder.as_ref().map(|f| f(value))
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("name", &self.name)
            .field("encoder", &self.encoder.is_some())
            .field("decoder", &self.decoder.is_some())
            .finish()
    }
}

/// Concurrent lookup tables for registered codecs.
#[derive(Default)]
pub struct CodecRegistry {
    by_name: DashMap<String, Arc<Codec>>,
    by_type: DashMap<TypeId, String>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a codec, replacing any previous one with the same name.
    /// Names of built-in envelope kinds are reserved.
    pub fn register(&self, codec: Codec) -> Result<()> {
        if codec.name.is_empty() || BUILTIN_TAGS.contains(&codec.name.as_str()) {
            return Err(RpcError::Codec(format!("reserved codec name: {:?}", codec.name)));
        }
        if let Some((_, old)) = self.by_name.remove(&codec.name) {
            tracing::debug!(codec = %old.name, "replacing codec");
            self.by_type.remove(&old.type_id);
        }
        self.by_type.insert(codec.type_id, codec.name.clone());
        self.by_name.insert(codec.name.clone(), Arc::new(codec));
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        match self.by_name.remove(name) {
            Some((_, codec)) => {
                self.by_type.remove(&codec.type_id);
                true
            }
            None => false,
        }
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Codec>> {
        self.by_name.get(name).map(|c| c.value().clone())
    }

    pub fn for_value(&self, value: &CustomValue) -> Option<Arc<Codec>> {
        let name = self.by_type.get(&value.value_type_id())?.value().clone();
        self.by_name(&name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
