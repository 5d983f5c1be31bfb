//! # Owned Value Tree
//!
//! `Packed` is the owned, in-memory form of a relaypack item. Maps keep their
//! insertion order; the wire carries entries in exactly that order.

use crate::Decoder;
use crate::Encoder;
use crate::Error;
use crate::MAX_DEPTH;
use crate::Result;
use crate::Tag;

/// An owned relaypack value.
#[derive(Debug, Clone, PartialEq)]
pub enum Packed {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Packed>),
    Map(Vec<(String, Packed)>),
}

impl Packed {
    /// Builds a map from `(key, value)` pairs, preserving their order.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Packed)>,
    {
        Packed::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Builds a string value.
    pub fn str(s: impl Into<String>) -> Self {
        Packed::Str(s.into())
    }

    /// Looks up a key in a map. Returns `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Packed> {
        match self {
            Packed::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Inserts or replaces a key in a map. No-op on non-maps.
    pub fn set(&mut self, key: &str, value: Packed) {
        if let Packed::Map(entries) = self {
            match entries.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value,
                None => entries.push((key.to_string(), value)),
            }
        }
    }

    /// Removes a key from a map, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Packed> {
        match self {
            Packed::Map(entries) => {
                let idx = entries.iter().position(|(k, _)| k == key)?;
                Some(entries.remove(idx).1)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Packed::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Packed::Int(v) => Some(*v),
            Packed::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Packed::Float(v) => Some(*v),
            Packed::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Packed::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Packed::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Packed]> {
        match self {
            Packed::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Packed::Nil)
    }

    /// Writes this value into the encoder.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Packed::Nil => enc.nil(),
            Packed::Bool(v) => enc.bool(*v),
            Packed::Int(v) => enc.int(*v),
            Packed::Float(v) => enc.float(*v),
            Packed::Str(v) => enc.str(v),
            Packed::Bytes(v) => enc.bytes(v),
            Packed::List(items) => {
                enc.list_begin()?;
                for item in items {
                    item.encode(enc)?;
                }
                enc.list_end()
            }
            Packed::Map(entries) => {
                enc.map_begin()?;
                for (key, value) in entries {
                    enc.entry_begin(key)?;
                    value.encode(enc)?;
                    enc.entry_end()?;
                }
                enc.map_end()
            }
        }
    }

    /// Reads one complete value from the decoder.
    ///
    /// Containers nested deeper than [`MAX_DEPTH`] fail with `Error::TooDeep`
    /// instead of recursing further.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Self::decode_at(dec, 0)
    }

    fn decode_at(dec: &mut Decoder<'_>, depth: usize) -> Result<Self> {
        let tag = dec.peek_tag()?;
        if matches!(tag, Tag::List | Tag::Map | Tag::Entry) && depth >= MAX_DEPTH {
            return Err(Error::TooDeep(MAX_DEPTH));
        }
        match tag {
            Tag::Nil => dec.nil().map(|_| Packed::Nil),
            Tag::True | Tag::False => dec.bool().map(Packed::Bool),
            Tag::Int => dec.int().map(Packed::Int),
            Tag::Float => dec.float().map(Packed::Float),
            Tag::String => dec.str().map(|s| Packed::Str(s.to_string())),
            Tag::Bytes => dec.bytes().map(|b| Packed::Bytes(b.to_vec())),
            Tag::List => {
                let mut iter = dec.list()?;
                let mut items = Vec::new();
                while let Some(mut item) = iter.next_item()? {
                    items.push(Packed::decode_at(&mut item, depth + 1)?);
                }
                Ok(Packed::List(items))
            }
            Tag::Map => {
                let mut iter = dec.map()?;
                let mut entries = Vec::new();
                while let Some((key, mut value)) = iter.next_entry()? {
                    entries.push((key.to_string(), Packed::decode_at(&mut value, depth + 1)?));
                }
                Ok(Packed::Map(entries))
            }
            Tag::Entry => {
                let (key, mut value) = dec.entry()?;
                Ok(Packed::Map(vec![(key.to_string(), Packed::decode_at(&mut value, depth + 1)?)]))
            }
        }
    }
}

impl From<&str> for Packed {
    fn from(v: &str) -> Self { Packed::Str(v.to_string()) }
}

impl From<String> for Packed {
    fn from(v: String) -> Self { Packed::Str(v) }
}

impl From<i64> for Packed {
    fn from(v: i64) -> Self { Packed::Int(v) }
}

impl From<bool> for Packed {
    fn from(v: bool) -> Self { Packed::Bool(v) }
}

impl From<f64> for Packed {
    fn from(v: f64) -> Self { Packed::Float(v) }
}

/// Serializes a single value into a fresh buffer.
pub fn pack(value: &Packed) -> Result<Vec<u8>> {
    pack_all(std::slice::from_ref(value))
}

/// Serializes several values back to back into one buffer.
pub fn pack_all(values: &[Packed]) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    for value in values {
        value.encode(&mut enc)?;
    }
    enc.into_bytes()
}

/// Deserializes exactly one value; trailing bytes are left unread.
pub fn unpack(bytes: &[u8]) -> Result<Packed> {
    Packed::decode(&mut Decoder::new(bytes))
}

/// Deserializes every value in the buffer, in order.
pub fn unpack_all(bytes: &[u8]) -> Result<Vec<Packed>> {
    let mut dec = Decoder::new(bytes);
    let mut out = Vec::new();
    while dec.remaining() > 0 {
        out.push(Packed::decode(&mut dec)?);
    }
    Ok(out)
}
