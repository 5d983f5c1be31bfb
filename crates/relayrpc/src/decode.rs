//! # Structural Decoder
//!
//! The mirror of the encoder. Envelopes become live values again; method and
//! callback references become [`Callable`] proxies that send a message when
//! invoked. A reference that points back at this very peer resolves to the
//! local function instead of a proxy.

use std::sync::Arc;

use futures::FutureExt;
use relaypack::Packed;

use crate::envelope::CallbackRef;
use crate::envelope::Envelope;
use crate::envelope::MethodRef;
use crate::envelope::RTYPE;
use crate::envelope::RVALUE;
use crate::error::Result;
use crate::error::RpcError;
use crate::peer::CallSpec;
use crate::peer::Inner;
use crate::remote::RemoteStream;
use crate::service::is_service_path;
use crate::value::Callable;
use crate::value::FunctionInfo;
use crate::value::NdArray;
use crate::value::TypedArray;
use crate::value::Value;

/// What a decoded proxy needs to know about the message it came in.
#[derive(Debug, Clone, Default)]
pub struct DecodeContext {
    /// The sender's session; proxies send it back as `parent`.
    pub remote_parent: Option<String>,
    /// Our own session the message was made under; proxies nest under it.
    pub local_parent: Option<String>,
    /// The sender's workspace, used to qualify bare targets.
    pub remote_workspace: Option<String>,
}

impl Inner {
    pub(crate) fn decode(self: &Arc<Self>, packed: &Packed, ctx: &DecodeContext) -> Result<Value> {
        let value = match packed {
            Packed::Nil => Value::Null,
            Packed::Bool(v) => Value::Bool(*v),
            Packed::Int(v) => Value::Int(*v),
            Packed::Float(v) => Value::Float(*v),
            Packed::Str(v) => Value::Str(v.clone()),
            Packed::Bytes(v) => Value::Bytes(v.clone()),
            Packed::List(items) => Value::List(self.decode_list(items, ctx)?),
            Packed::Map(entries) => match Envelope::parse(packed)? {
                None => self.decode_map(entries, ctx)?,
                Some(envelope) => self.decode_envelope(envelope, packed, entries, ctx)?,
            },
        };
        Ok(value)
    }

    fn decode_list(self: &Arc<Self>, items: &[Packed], ctx: &DecodeContext) -> Result<Vec<Value>> {
        items.iter().map(|item| self.decode(item, ctx)).collect()
    }

    fn decode_map(self: &Arc<Self>, entries: &[(String, Packed)], ctx: &DecodeContext) -> Result<Value> {
        entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.decode(v, ctx)?)))
            .collect::<Result<Vec<_>>>()
            .map(Value::Map)
    }

    fn decode_envelope(
        self: &Arc<Self>,
        envelope: Envelope<'_>,
        packed: &Packed,
        entries: &[(String, Packed)],
        ctx: &DecodeContext,
    ) -> Result<Value> {
        let value = match envelope {
            Envelope::Method(reference) => Value::Function(self.method_proxy(reference, packed, ctx)),
            Envelope::Callback(reference) => Value::Function(self.callback_proxy(reference, packed)),
            Envelope::Interface(inner) => self.decode(inner, ctx)?,
            Envelope::NdArray { data, shape, dtype } => Value::NdArray(NdArray::new(dtype, shape, data.to_vec())),
            Envelope::TypedArray { data, dtype } => Value::TypedArray(TypedArray::new(dtype, data.to_vec())),
            Envelope::MemoryView(data) => Value::MemoryView(data.to_vec()),
            Envelope::Error(message) => Value::Error(message.to_string()),
            Envelope::OrderedMap(pairs) => {
                let pairs = pairs
                    .iter()
                    .map(|pair| match pair.as_list() {
                        Some([k, v]) => Ok((self.decode(k, ctx)?, self.decode(v, ctx)?)),
                        _ => Err(RpcError::Protocol("orderedmap entry is not a pair".into())),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Value::OrderedMap(pairs)
            }
            Envelope::Set(items) => Value::Set(self.decode_list(items, ctx)?),
            Envelope::IoStream(env) => {
                let method = |key: &str| -> Result<Callable> {
                    let field = env
                        .get(key)
                        .ok_or_else(|| RpcError::Protocol(format!("iostream without {key}")))?;
                    match self.decode(field, ctx)? {
                        Value::Function(f) => Ok(f),
                        _ => Err(RpcError::Protocol(format!("iostream {key} is not a method"))),
                    }
                };
                let (read, seek) = (method("read")?, method("seek")?);
                let metadata = entries
                    .iter()
                    .filter(|(k, _)| !matches!(k.as_str(), RTYPE | "read" | "seek"))
                    .map(|(k, v)| Ok((k.clone(), self.decode(v, ctx)?)))
                    .collect::<Result<Vec<_>>>()?;
                Value::Stream(Arc::new(RemoteStream::new(read, seek, metadata)))
            }
            Envelope::Other(tag) => match self.codecs.by_name(tag) {
                Some(codec) => {
                    let encoded = match packed.get(RVALUE) {
                        Some(inner) => self.decode(inner, ctx)?,
                        None => {
                            let rest: Vec<_> = entries.iter().filter(|(k, _)| k != RTYPE).cloned().collect();
                            self.decode_map(&rest, ctx)?
                        }
                    };
                    match codec.decode(encoded.clone()) {
                        Some(result) => result?,
                        None => encoded,
                    }
                }
                None => self.decode_map(entries, ctx)?,
            },
        };
        Ok(value)
    }

    fn method_proxy(self: &Arc<Self>, reference: MethodRef, origin: &Packed, ctx: &DecodeContext) -> Callable {
        let target = match (&ctx.remote_workspace, reference.target.contains('/')) {
            (Some(ws), false) => format!("{ws}/{}", reference.target),
            _ => reference.target.clone(),
        };

        if target == self.wire_id {
            let local = if is_service_path(&reference.method) {
                let ws = self.config.workspace.as_deref();
                self.services.resolve(&reference.method, ws, ws).ok().map(|r| r.callable)
            } else {
                self.sessions.lookup_own(&reference.method)
            };
            if let Some(local) = local {
                return local;
            }
        }

        let weak = Arc::downgrade(self);
        let spec = CallSpec {
            remote_parent: ctx.remote_parent.clone(),
            local_parent: ctx.local_parent.clone(),
            promise: reference.promise,
            ..CallSpec::new(target, reference.method)
        };
        Callable::remote(
            origin.clone(),
            reference.info,
            Arc::new(move |args: Vec<Value>| {
                let weak = weak.clone();
                let spec = spec.clone();
                async move {
                    let inner = weak.upgrade().ok_or(RpcError::Disconnected)?;
                    inner.call_remote(spec, args).await
                }
                .boxed()
            }),
        )
    }

    fn callback_proxy(self: &Arc<Self>, reference: CallbackRef<'_>, origin: &Packed) -> Callable {
        let weak = Arc::downgrade(self);
        let target = reference.target.to_string();
        let index = reference.index;
        Callable::remote(
            origin.clone(),
            FunctionInfo::default(),
            Arc::new(move |args: Vec<Value>| {
                let weak = weak.clone();
                let target = target.clone();
                async move {
                    let inner = weak.upgrade().ok_or(RpcError::Disconnected)?;
                    inner.send_callback(&target, index, args).await?;
                    Ok::<_, RpcError>(Value::Null)
                }
                .boxed()
            }),
        )
    }
}
