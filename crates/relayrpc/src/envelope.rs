//! # Wire Envelopes
//!
//! Non-plain values travel as maps tagged with `_rtype`. This module names the
//! keys, builds the two reference envelopes (`method`, `callback`) and
//! classifies an incoming tagged map into a closed [`Envelope`] enum.
//!
//! ## Envelope Kinds
//!
//! ```text
//! method      { _rtype, _rtarget, _rmethod, _rpromise, _rname?, _rdoc?, _rsig? }
//! callback    { _rtype, _rtarget, _rindex, _rpair? }
//! interface   { _rtype, _rvalue: <service map> }
//! ndarray     { _rtype, _rvalue: bytes, _rshape, _rdtype }
//! typedarray  { _rtype, _rvalue: bytes, _rdtype }
//! memoryview  { _rtype, _rvalue: bytes }
//! error       { _rtype, _rvalue: message }
//! orderedmap  { _rtype, _rvalue: [[k, v], ...] }
//! set         { _rtype, _rvalue: [...] }
//! iostream    { _rtype, read: <method>, seek: <method>, ...metadata }
//! <codec>     { _rtype, ... } or { _rtype, _rvalue }
//! ```

use relaypack::Packed;

use crate::error::Result;
use crate::error::RpcError;
use crate::value::DType;
use crate::value::FunctionInfo;

pub const RTYPE: &str = "_rtype";
pub const RVALUE: &str = "_rvalue";
pub const RTARGET: &str = "_rtarget";
pub const RMETHOD: &str = "_rmethod";
pub const RPROMISE: &str = "_rpromise";
pub const RINDEX: &str = "_rindex";
pub const RPAIR: &str = "_rpair";
pub const RNAME: &str = "_rname";
pub const RDOC: &str = "_rdoc";
pub const RSIG: &str = "_rsig";
pub const RSHAPE: &str = "_rshape";
pub const RDTYPE: &str = "_rdtype";

/// Tags owned by the engine; codecs may not claim them.
pub const BUILTIN_TAGS: &[&str] = &[
    "method",
    "callback",
    "interface",
    "ndarray",
    "typedarray",
    "memoryview",
    "error",
    "orderedmap",
    "set",
    "iostream",
];

/// A reference to a function living on `target`, addressed by dotted path.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRef {
    pub target: String,
    pub method: String,
    /// Whether calls expect a reply.
    pub promise: bool,
    pub info: FunctionInfo,
}

impl MethodRef {
    pub fn new(target: impl Into<String>, method: impl Into<String>, promise: bool) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            promise,
            info: FunctionInfo::default(),
        }
    }

    pub fn to_packed(&self) -> Packed {
        let mut env = Packed::map([
            (RTYPE, Packed::str("method")),
            (RTARGET, Packed::str(&self.target)),
            (RMETHOD, Packed::str(&self.method)),
            (RPROMISE, Packed::Bool(self.promise)),
        ]);
        if let Some(name) = &self.info.name {
            env.set(RNAME, Packed::str(name));
        }
        if let Some(doc) = &self.info.doc {
            env.set(RDOC, Packed::str(doc));
        }
        if let Some(sig) = &self.info.signature {
            env.set(RSIG, Packed::str(sig));
        }
        env
    }

    fn from_packed(env: &Packed) -> Result<Self> {
        let text = |key: &str| env.get(key).and_then(Packed::as_str).map(str::to_string);
        Ok(Self {
            target: require_str(env, RTARGET)?.to_string(),
            method: require_str(env, RMETHOD)?.to_string(),
            promise: env.get(RPROMISE).and_then(Packed::as_bool).unwrap_or(true),
            info: FunctionInfo {
                name: text(RNAME),
                doc: text(RDOC),
                signature: text(RSIG),
            },
        })
    }
}

/// A reference to a one-shot handle in the owner's reference store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackRef<'a> {
    pub target: &'a str,
    pub index: u32,
    pub pair: Option<u32>,
}

impl CallbackRef<'_> {
    pub fn to_packed(&self) -> Packed {
        let mut env = Packed::map([
            (RTYPE, Packed::str("callback")),
            (RTARGET, Packed::str(self.target)),
            (RINDEX, Packed::Int(self.index as i64)),
        ]);
        if let Some(pair) = self.pair {
            env.set(RPAIR, Packed::Int(pair as i64));
        }
        env
    }
}

/// A tagged map, classified by its `_rtype`.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<'a> {
    Method(MethodRef),
    Callback(CallbackRef<'a>),
    Interface(&'a Packed),
    NdArray { data: &'a [u8], shape: Vec<usize>, dtype: DType },
    TypedArray { data: &'a [u8], dtype: DType },
    MemoryView(&'a [u8]),
    Error(&'a str),
    OrderedMap(&'a [Packed]),
    Set(&'a [Packed]),
    IoStream(&'a Packed),
    /// A tag the engine does not own: a codec name, or unknown.
    Other(&'a str),
}

impl<'a> Envelope<'a> {
    /// Returns `Ok(None)` when `value` is not a tagged map.
    pub fn parse(value: &'a Packed) -> Result<Option<Self>> {
        let Some(tag) = value.get(RTYPE).and_then(Packed::as_str) else {
            return Ok(None);
        };

        let envelope = match tag {
            "method" => Envelope::Method(MethodRef::from_packed(value)?),
            "callback" => Envelope::Callback(CallbackRef {
                target: require_str(value, RTARGET)?,
                index: require_index(value, RINDEX)?,
                pair: match value.get(RPAIR) {
                    Some(_) => Some(require_index(value, RPAIR)?),
                    None => None,
                },
            }),
            "interface" => Envelope::Interface(require(value, RVALUE)?),
            "ndarray" => Envelope::NdArray {
                data: require_bytes(value, RVALUE)?,
                shape: require_shape(value)?,
                dtype: DType::parse(require_str(value, RDTYPE)?),
            },
            "typedarray" => Envelope::TypedArray {
                data: require_bytes(value, RVALUE)?,
                dtype: DType::parse(require_str(value, RDTYPE)?),
            },
            "memoryview" => Envelope::MemoryView(require_bytes(value, RVALUE)?),
            "error" => Envelope::Error(require_str(value, RVALUE)?),
            "orderedmap" => Envelope::OrderedMap(require_list(value, RVALUE)?),
            "set" => Envelope::Set(require_list(value, RVALUE)?),
            "iostream" => Envelope::IoStream(value),
            other => Envelope::Other(other),
        };
        Ok(Some(envelope))
    }
}

fn require<'a>(env: &'a Packed, key: &str) -> Result<&'a Packed> {
    env.get(key)
        .ok_or_else(|| RpcError::Protocol(format!("envelope missing {key}")))
}

fn require_str<'a>(env: &'a Packed, key: &str) -> Result<&'a str> {
    require(env, key)?
        .as_str()
        .ok_or_else(|| RpcError::Protocol(format!("envelope field {key} is not a string")))
}

fn require_bytes<'a>(env: &'a Packed, key: &str) -> Result<&'a [u8]> {
    require(env, key)?
        .as_bytes()
        .ok_or_else(|| RpcError::Protocol(format!("envelope field {key} is not bytes")))
}

fn require_list<'a>(env: &'a Packed, key: &str) -> Result<&'a [Packed]> {
    require(env, key)?
        .as_list()
        .ok_or_else(|| RpcError::Protocol(format!("envelope field {key} is not a list")))
}

fn require_index(env: &Packed, key: &str) -> Result<u32> {
    require(env, key)?
        .as_int()
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| RpcError::Protocol(format!("envelope field {key} is not a handle")))
}

fn require_shape(env: &Packed) -> Result<Vec<usize>> {
    require_list(env, RSHAPE)?
        .iter()
        .map(|dim| {
            dim.as_int()
                .and_then(|d| usize::try_from(d).ok())
                .ok_or_else(|| RpcError::Protocol("invalid ndarray shape".into()))
        })
        .collect()
}
