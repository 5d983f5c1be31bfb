//! # Message Framing
//!
//! Every message is two relaypack values written back to back:
//!
//! ```text
//! main:  { type, from, to, method?, session?, parent?, index? }
//! extra: { args?, with_kwargs?, promise? }
//! ```
//!
//! The main segment is small and routable on its own; a hub only ever reads
//! it. Messages of unknown `type` are kept whole so they can be surfaced as
//! events.

use relaypack::Packed;

use crate::error::Result;
use crate::error::RpcError;

pub const TYPE_METHOD: &str = "method";
pub const TYPE_CALLBACK: &str = "callback";

/// The routing fields of the main segment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Header {
    pub kind: String,
    pub from: String,
    pub to: String,
    pub method: Option<String>,
    pub session: Option<String>,
    pub parent: Option<String>,
    pub index: Option<u32>,
}

impl Header {
    pub fn method(from: &str, to: &str, method: &str) -> Self {
        Self {
            kind: TYPE_METHOD.into(),
            from: from.into(),
            to: to.into(),
            method: Some(method.into()),
            ..Self::default()
        }
    }

    pub fn callback(from: &str, to: &str, index: u32) -> Self {
        Self {
            kind: TYPE_CALLBACK.into(),
            from: from.into(),
            to: to.into(),
            index: Some(index),
            ..Self::default()
        }
    }

    pub fn to_packed(&self) -> Packed {
        let mut main = Packed::map([
            ("type", Packed::str(&self.kind)),
            ("from", Packed::str(&self.from)),
            ("to", Packed::str(&self.to)),
        ]);
        if let Some(method) = &self.method {
            main.set("method", Packed::str(method));
        }
        if let Some(session) = &self.session {
            main.set("session", Packed::str(session));
        }
        if let Some(parent) = &self.parent {
            main.set("parent", Packed::str(parent));
        }
        if let Some(index) = self.index {
            main.set("index", Packed::Int(index as i64));
        }
        main
    }

    pub fn from_packed(main: &Packed) -> Result<Self> {
        let text = |key: &str| main.get(key).and_then(Packed::as_str).map(str::to_string);
        let required = |key: &str| {
            text(key).ok_or_else(|| RpcError::Protocol(format!("message missing {key}")))
        };
        Ok(Self {
            kind: required("type")?,
            from: required("from")?,
            to: required("to")?,
            method: text("method"),
            session: text("session"),
            parent: text("parent"),
            index: main
                .get("index")
                .and_then(Packed::as_int)
                .and_then(|i| u32::try_from(i).ok()),
        })
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    /// The main segment as received, including fields beyond the header.
    pub main: Packed,
    pub extra: Packed,
}

impl Frame {
    pub fn new(header: Header, extra: Packed) -> Self {
        Self { main: header.to_packed(), header, extra }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = relaypack::pack(&self.main)?;
        bytes.extend(relaypack::pack(&self.extra)?);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut segments = relaypack::unpack_all(bytes)?.into_iter();
        let main = segments
            .next()
            .ok_or_else(|| RpcError::Protocol("empty message".into()))?;
        let extra = segments.next().unwrap_or_else(|| Packed::Map(Vec::new()));
        if segments.next().is_some() {
            return Err(RpcError::Protocol("trailing segments after extra".into()));
        }
        let header = Header::from_packed(&main)?;
        Ok(Self { header, main, extra })
    }

    pub fn args(&self) -> &[Packed] {
        self.extra.get("args").and_then(Packed::as_list).unwrap_or(&[])
    }

    pub fn with_kwargs(&self) -> bool {
        self.extra.get("with_kwargs").and_then(Packed::as_bool).unwrap_or(false)
    }

    pub fn promise(&self) -> Option<&Packed> {
        self.extra.get("promise").filter(|p| !p.is_nil())
    }
}

/// Reads only the `to` field of a message's main segment.
pub fn peek_destination(bytes: &[u8]) -> Result<String> {
    let main = relaypack::unpack(bytes)?;
    main.get("to")
        .and_then(Packed::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::Protocol("message missing to".into()))
}
