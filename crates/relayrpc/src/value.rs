//! # Live Values
//!
//! `Value` is everything a peer can hand to, or receive from, the other side:
//! plain data, binary views, functions, byte streams and opaque custom objects.
//! The structural encoder turns it into a `Packed` tree; the decoder turns the
//! tree back into live values, with remote functions becoming local proxies.
//!
//! ## Invariants
//!
//! - Map entries keep their insertion order, on the wire and after decode.
//! - Typed and n-dimensional buffers are little-endian and round-trip
//!   byte-identically.
//! - Every [`Callable`] has a process-unique [`FunctionId`]. Annotations for
//!   service methods are keyed by that id, never stored on the function.

use std::any::Any;
use std::any::TypeId;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use relaypack::Packed;

use crate::error::Result;
use crate::error::RpcError;

/// Marker key that flags a trailing map argument as keyword arguments.
pub const KWARGS_MARKER: &str = "_rkwargs";

// ============================================================================
//  VALUE
// ============================================================================

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Raw byte array, carried through as-is.
    Bytes(Vec<u8>),
    /// A raw binary buffer; travels as a `memoryview` envelope.
    MemoryView(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
    /// A map with arbitrary keys, insertion ordered.
    OrderedMap(Vec<(Value, Value)>),
    Set(Vec<Value>),
    TypedArray(TypedArray),
    NdArray(NdArray),
    /// An error travelling as data; only its message survives.
    Error(String),
    /// A service mapping, as returned by `get_service`. Encodes as an
    /// `interface` envelope and decodes back to a plain [`Value::Map`].
    Interface(Vec<(String, Value)>),
    Function(Callable),
    Stream(Arc<dyn ByteStream>),
    Custom(CustomValue),
}

impl Value {
    /// Builds a map from `(key, value)` pairs, preserving their order.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Wraps an async closure as a function value.
    pub fn function<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Value::Function(Callable::new(f))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) | Value::MemoryView(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) | Value::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Callable> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_typed_array(&self) -> Option<&TypedArray> {
        match self {
            Value::TypedArray(v) => Some(v),
            _ => None,
        }
    }

    /// Map entries of a `Map` or an `Interface`.
    pub fn entries(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(v) | Value::Interface(v) => Some(v),
            _ => None,
        }
    }

    /// Looks up a key in a map. Returns `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Walks a dotted path through nested maps and lists.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                other => other.get(segment)?,
            };
        }
        Some(current)
    }

    /// Inserts or replaces a key in a map. No-op on non-maps.
    pub fn set(&mut self, key: &str, value: Value) {
        if let Value::Map(entries) | Value::Interface(entries) = self {
            match entries.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value,
                None => entries.push((key.to_string(), value)),
            }
        }
    }

    /// Removes a key from a map, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        match self {
            Value::Map(entries) | Value::Interface(entries) => {
                let idx = entries.iter().position(|(k, _)| k == key)?;
                Some(entries.remove(idx).1)
            }
            _ => None,
        }
    }

    /// Whether this is a map flagged with the keyword-argument marker.
    pub fn is_kwargs(&self) -> bool {
        matches!(self, Value::Map(_)) && self.get(KWARGS_MARKER).and_then(Value::as_bool) == Some(true)
    }

    /// Short human name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::MemoryView(_) => "memoryview",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::OrderedMap(_) => "orderedmap",
            Value::Set(_) => "set",
            Value::TypedArray(_) => "typedarray",
            Value::NdArray(_) => "ndarray",
            Value::Error(_) => "error",
            Value::Interface(_) => "interface",
            Value::Function(_) => "function",
            Value::Stream(_) => "iostream",
            Value::Custom(c) => c.type_name(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (MemoryView(a), MemoryView(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (OrderedMap(a), OrderedMap(b)) => a == b,
            (Set(a), Set(b)) => a == b,
            (TypedArray(a), TypedArray(b)) => a == b,
            (NdArray(a), NdArray(b)) => a == b,
            (Error(a), Error(b)) => a == b,
            (Interface(a), Interface(b)) => a == b,
            (Function(a), Function(b)) => a.id() == b.id(),
            (Stream(a), Stream(b)) => Arc::ptr_eq(a, b),
            (Custom(a), Custom(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Str(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::Str(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v as i64) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Value::List(v) }
}

impl From<Callable> for Value {
    fn from(v: Callable) -> Self { Value::Function(v) }
}

impl From<TypedArray> for Value {
    fn from(v: TypedArray) -> Self { Value::TypedArray(v) }
}

/// Builds a keyword-argument map: pass it as the last argument of a call and
/// the callee receives it as a plain map, flagged through `with_kwargs`.
pub fn kwargs<K, I>(pairs: I) -> Value
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    let mut map = Value::map(pairs);
    map.set(KWARGS_MARKER, Value::Bool(true));
    map
}

// ============================================================================
//  BINARY VIEWS
// ============================================================================

/// Element type of a typed or n-dimensional buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Int8,
    Int16,
    Int32,
    Uint8,
    Uint16,
    Uint32,
    Float32,
    Float64,
    /// Generic fallback for element types without a fixed-width view.
    Array,
}

impl DType {
    pub fn as_str(self) -> &'static str {
        match self {
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Uint8 => "uint8",
            DType::Uint16 => "uint16",
            DType::Uint32 => "uint32",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Array => "array",
        }
    }

    /// Unknown names map to [`DType::Array`].
    pub fn parse(name: &str) -> DType {
        match name {
            "int8" => DType::Int8,
            "int16" => DType::Int16,
            "int32" => DType::Int32,
            "uint8" => DType::Uint8,
            "uint16" => DType::Uint16,
            "uint32" => DType::Uint32,
            "float32" => DType::Float32,
            "float64" => DType::Float64,
            _ => DType::Array,
        }
    }

    /// Width of one element in bytes; `None` for [`DType::Array`].
    pub fn element_size(self) -> Option<usize> {
        match self {
            DType::Int8 | DType::Uint8 => Some(1),
            DType::Int16 | DType::Uint16 => Some(2),
            DType::Int32 | DType::Uint32 | DType::Float32 => Some(4),
            DType::Float64 => Some(8),
            DType::Array => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed-width numeric type that can back a typed view.
pub trait Element: Copy + Sized {
    const DTYPE: DType;
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(i8, DType::Int8);
impl_element!(i16, DType::Int16);
impl_element!(i32, DType::Int32);
impl_element!(u8, DType::Uint8);
impl_element!(u16, DType::Uint16);
impl_element!(u32, DType::Uint32);
impl_element!(f32, DType::Float32);
impl_element!(f64, DType::Float64);

fn to_le_bytes<T: Element>(items: &[T]) -> Vec<u8> {
    let mut data = Vec::with_capacity(items.len() * std::mem::size_of::<T>());
    for item in items {
        item.write_le(&mut data);
    }
    data
}

fn from_le_bytes<T: Element>(dtype: DType, data: &[u8]) -> Result<Vec<T>> {
    if dtype != T::DTYPE {
        return Err(RpcError::InvalidArgument(format!(
            "buffer holds {}, not {}",
            dtype,
            T::DTYPE
        )));
    }
    let width = std::mem::size_of::<T>();
    if data.len() % width != 0 {
        return Err(RpcError::InvalidArgument(format!(
            "{} bytes is not a whole number of {} elements",
            data.len(),
            dtype
        )));
    }
    Ok(data.chunks_exact(width).map(T::read_le).collect())
}

/// A one-dimensional typed view over a little-endian buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArray {
    pub dtype: DType,
    pub data: Vec<u8>,
}

impl TypedArray {
    pub fn new(dtype: DType, data: Vec<u8>) -> Self {
        Self { dtype, data }
    }

    pub fn from_slice<T: Element>(items: &[T]) -> Self {
        Self { dtype: T::DTYPE, data: to_le_bytes(items) }
    }

    /// Reads the buffer back as elements of `T`; the dtype must match.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        from_le_bytes(self.dtype, &self.data)
    }

    /// Number of elements, or bytes for [`DType::Array`].
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.element_size().unwrap_or(1)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An n-dimensional array: a flat little-endian buffer plus its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl NdArray {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Self {
        Self { dtype, shape, data }
    }

    pub fn from_slice<T: Element>(shape: Vec<usize>, items: &[T]) -> Self {
        Self { dtype: T::DTYPE, shape, data: to_le_bytes(items) }
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        from_le_bytes(self.dtype, &self.data)
    }
}

// ============================================================================
//  FUNCTIONS
// ============================================================================

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Callable`]; clones share it.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct FunctionId(pub u64);

impl FunctionId {
    fn next() -> Self {
        FunctionId(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn-{}", self.0)
    }
}

/// Optional descriptive metadata. Empty fields are simply not sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionInfo {
    pub name: Option<String>,
    pub doc: Option<String>,
    pub signature: Option<String>,
}

pub type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// An invocable function value, local or remote.
///
/// Remote functions carry the envelope they were decoded from as their
/// origin; re-encoding them emits that envelope unchanged.
#[derive(Clone)]
pub struct Callable {
    id: FunctionId,
    handler: Handler,
    info: FunctionInfo,
    origin: Option<Arc<Packed>>,
}

impl Callable {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            id: FunctionId::next(),
            handler: Arc::new(move |args| f(args).boxed()),
            info: FunctionInfo::default(),
            origin: None,
        }
    }

    /// Wraps a synchronous closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(move |args| futures::future::ready(f(args)))
    }

    pub(crate) fn remote(origin: Packed, info: FunctionInfo, handler: Handler) -> Self {
        Self {
            id: FunctionId::next(),
            handler,
            info,
            origin: Some(Arc::new(origin)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.info.name = Some(name.into());
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.info.doc = Some(doc.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.info.signature = Some(signature.into());
        self
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn info(&self) -> &FunctionInfo {
        &self.info
    }

    /// The envelope this function was decoded from, if it is remote.
    pub fn origin(&self) -> Option<&Packed> {
        self.origin.as_deref()
    }

    pub fn is_remote(&self) -> bool {
        self.origin.is_some()
    }

    pub fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        (self.handler)(args)
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callable")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .field("remote", &self.origin.is_some())
            .finish()
    }
}

// ============================================================================
//  STREAMS
// ============================================================================

/// A readable, seekable byte source that travels as an `iostream` envelope.
#[async_trait::async_trait]
pub trait ByteStream: Send + Sync + 'static {
    /// Reads up to `size` bytes, or everything left when `None`.
    async fn read(&self, size: Option<usize>) -> Result<Vec<u8>>;

    /// Moves the cursor to an absolute offset and returns it.
    async fn seek(&self, pos: u64) -> Result<u64>;

    /// Extra descriptive fields sent alongside the stream methods.
    fn metadata(&self) -> Vec<(String, Value)> {
        Vec::new()
    }
}

impl std::fmt::Debug for dyn ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream").finish_non_exhaustive()
    }
}

/// An in-memory [`ByteStream`].
pub struct MemoryStream {
    data: Vec<u8>,
    pos: Mutex<usize>,
    metadata: Vec<(String, Value)>,
}

impl MemoryStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: Mutex::new(0), metadata: Vec::new() }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.push((key.into(), value));
        self
    }
}

#[async_trait::async_trait]
impl ByteStream for MemoryStream {
    async fn read(&self, size: Option<usize>) -> Result<Vec<u8>> {
        let mut pos = self.pos.lock();
        let start = (*pos).min(self.data.len());
        let end = match size {
            Some(n) => start.saturating_add(n).min(self.data.len()),
            None => self.data.len(),
        };
        *pos = end;
        Ok(self.data[start..end].to_vec())
    }

    async fn seek(&self, pos: u64) -> Result<u64> {
        let target = usize::try_from(pos)
            .map_err(|_| RpcError::InvalidArgument(format!("seek offset {pos} out of range")))?;
        *self.pos.lock() = target.min(self.data.len());
        Ok(pos.min(self.data.len() as u64))
    }

    fn metadata(&self) -> Vec<(String, Value)> {
        self.metadata.clone()
    }
}

// ============================================================================
//  CUSTOM OBJECTS
// ============================================================================

/// An opaque application object. It crosses the wire only when a codec for
/// its concrete type is registered.
#[derive(Clone)]
pub struct CustomValue {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl CustomValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// The `TypeId` of the wrapped object, not of the wrapper.
    pub fn value_type_id(&self) -> TypeId {
        Any::type_id(&*self.inner)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Debug for CustomValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CustomValue({})", self.type_name)
    }
}
