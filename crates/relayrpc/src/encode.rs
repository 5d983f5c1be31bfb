//! # Structural Encoder
//!
//! Turns live [`Value`]s into wire-safe `Packed` trees. Plain data passes
//! through; everything else becomes an `_rtype` envelope. Functions are the
//! interesting case: a local function is minted as a session callback (or
//! addressed by its service path, if it is an exported method), while a
//! function that came from a remote peer re-emits its original envelope.

use std::sync::Arc;

use relaypack::Packed;

use crate::envelope::MethodRef;
use crate::envelope::RDTYPE;
use crate::envelope::RSHAPE;
use crate::envelope::RTYPE;
use crate::envelope::RVALUE;
use crate::error::Result;
use crate::error::RpcError;
use crate::peer::Inner;
use crate::value::ByteStream;
use crate::value::Callable;
use crate::value::CustomValue;
use crate::value::Value;

/// Where minted callbacks go: the session they belong to and the peer
/// allowed to call them.
#[derive(Debug, Clone, Copy)]
pub struct EncodeContext<'a> {
    pub session: &'a str,
    pub target: &'a str,
}

fn tagged(tag: &str, value: Packed) -> Packed {
    Packed::map([(RTYPE, Packed::str(tag)), (RVALUE, value)])
}

impl Inner {
    pub(crate) fn encode(&self, value: &Value, ctx: &EncodeContext<'_>) -> Result<Packed> {
        let packed = match value {
            Value::Null => Packed::Nil,
            Value::Bool(v) => Packed::Bool(*v),
            Value::Int(v) => Packed::Int(*v),
            Value::Float(v) => Packed::Float(*v),
            Value::Str(v) => Packed::Str(v.clone()),
            Value::Bytes(v) => Packed::Bytes(v.clone()),
            Value::MemoryView(v) => tagged("memoryview", Packed::Bytes(v.clone())),
            Value::Function(f) => self.encode_function(f, ctx),
            Value::Custom(c) => self.encode_custom(c, ctx)?,
            Value::NdArray(a) => Packed::map([
                (RTYPE, Packed::str("ndarray")),
                (RVALUE, Packed::Bytes(a.data.clone())),
                (RSHAPE, Packed::List(a.shape.iter().map(|d| Packed::Int(*d as i64)).collect())),
                (RDTYPE, Packed::str(a.dtype.as_str())),
            ]),
            Value::Error(msg) => tagged("error", Packed::str(msg)),
            Value::Stream(s) => self.encode_stream(s, ctx)?,
            Value::TypedArray(a) => Packed::map([
                (RTYPE, Packed::str("typedarray")),
                (RVALUE, Packed::Bytes(a.data.clone())),
                (RDTYPE, Packed::str(a.dtype.as_str())),
            ]),
            Value::Set(items) => tagged("set", self.encode_list(items, ctx)?),
            Value::OrderedMap(pairs) => {
                let entries = pairs
                    .iter()
                    .map(|(k, v)| Ok(Packed::List(vec![self.encode(k, ctx)?, self.encode(v, ctx)?])))
                    .collect::<Result<Vec<_>>>()?;
                tagged("orderedmap", Packed::List(entries))
            }
            Value::Interface(entries) => tagged("interface", self.encode_map(entries, ctx)?),
            Value::List(items) => self.encode_list(items, ctx)?,
            Value::Map(entries) => self.encode_map(entries, ctx)?,
        };
        Ok(packed)
    }

    fn encode_list(&self, items: &[Value], ctx: &EncodeContext<'_>) -> Result<Packed> {
        items
            .iter()
            .map(|item| self.encode(item, ctx))
            .collect::<Result<Vec<_>>>()
            .map(Packed::List)
    }

    fn encode_map(&self, entries: &[(String, Value)], ctx: &EncodeContext<'_>) -> Result<Packed> {
        entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.encode(v, ctx)?)))
            .collect::<Result<Vec<_>>>()
            .map(Packed::Map)
    }

    fn encode_function(&self, f: &Callable, ctx: &EncodeContext<'_>) -> Packed {
        if let Some(origin) = f.origin() {
            return origin.clone();
        }
        let method = match self.services.annotation(f.id()) {
            Some(annotation) => annotation.method_id,
            None => self.sessions.mint(ctx.session, ctx.target, f.clone()),
        };
        let mut reference = MethodRef::new(&self.wire_id, method, true);
        reference.info = f.info().clone();
        reference.to_packed()
    }

    fn encode_custom(&self, value: &CustomValue, ctx: &EncodeContext<'_>) -> Result<Packed> {
        let unsupported = || RpcError::UnsupportedType(value.type_name().to_string());
        let codec = self.codecs.for_value(value).ok_or_else(unsupported)?;
        let encoded = codec.encode(value).ok_or_else(unsupported)??;
        match encoded {
            Value::Map(mut entries) => {
                if !entries.iter().any(|(k, _)| k == RTYPE) {
                    entries.push((RTYPE.to_string(), Value::str(codec.name())));
                }
                self.encode_map(&entries, ctx)
            }
            other => Ok(tagged(codec.name(), self.encode(&other, ctx)?)),
        }
    }

    fn encode_stream(&self, stream: &Arc<dyn ByteStream>, ctx: &EncodeContext<'_>) -> Result<Packed> {
        let source = stream.clone();
        let read = Callable::new(move |args: Vec<Value>| {
            let source = source.clone();
            async move {
                let size = args
                    .first()
                    .and_then(Value::as_int)
                    .and_then(|n| usize::try_from(n).ok());
                source.read(size).await.map(Value::Bytes)
            }
        })
        .with_name("read");

        let source = stream.clone();
        let seek = Callable::new(move |args: Vec<Value>| {
            let source = source.clone();
            async move {
                let pos = args
                    .first()
                    .and_then(Value::as_int)
                    .and_then(|n| u64::try_from(n).ok())
                    .ok_or_else(|| RpcError::InvalidArgument("seek expects an offset".into()))?;
                source.seek(pos).await.map(|p| Value::Int(p as i64))
            }
        })
        .with_name("seek");

        let mut env = Packed::map([
            (RTYPE, Packed::str("iostream")),
            ("read", self.encode_function(&read, ctx)),
            ("seek", self.encode_function(&seek, ctx)),
        ]);
        for (key, value) in stream.metadata() {
            env.set(&key, self.encode(&value, ctx)?);
        }
        Ok(env)
    }
}
