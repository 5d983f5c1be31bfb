//! # Relaypack
//!
//! A small, self-describing binary format for dynamic RPC payloads.
//!
//! ## Philosophy
//!
//! - **Schema-free**: Every item carries its own tag, so a receiver can walk a
//!   payload without knowing its shape in advance.
//! - **TLV Architecture**: `[Tag][Length?][Value]` structure enables safe skipping.
//! - **Streamable**: Several top-level items may be written back to back into one
//!   buffer and read out again sequentially.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: 0 | 8]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b][Body: Len]`
//! - **Map entries**: `[Tag: 1b][Len: 4b][Key: String][Value]`
//!
//! All integers are Little-Endian.

mod packed;


pub use crate::packed::Packed;
pub use crate::packed::pack;
pub use crate::packed::pack_all;
pub use crate::packed::unpack;
pub use crate::packed::unpack_all;

/// Relaypack serialization and deserialization errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`.
    InvalidTag(u8),
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// Closing a scope that does not match the active scope stack.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Attempted to close a scope when only the Root remains.
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open scopes.
    ScopeStillOpen,
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Blob or container length exceeds `u32::MAX`.
    BlobTooLarge(usize),
    /// Attempted to write more than one value into a map entry.
    TooManyItems,
    /// Attempted to close a map entry without a value.
    EmptyEntry,
    /// Attempted to write something other than an entry directly into a map.
    InvalidMapEntry,
    /// Containers nested deeper than the given limit.
    TooDeep(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "invalid tag byte: {:#04x}", b),
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "scope mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::UnexpectedEnd => write!(f, "unexpected end of buffer"),
            Error::BlobTooLarge(n) => write!(f, "blob of {} bytes exceeds the u32 length limit", n),
            Error::TooDeep(limit) => write!(f, "containers nested deeper than {} levels", limit),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Deepest container nesting `Packed::decode` will follow.
pub const MAX_DEPTH: usize = 128;

/// Specialized `Result` for Relaypack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the type of the encoded value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Nil = 0x01,
    True = 0x02,
    False = 0x03,
    /// Signed 64-bit integer.
    Int = 0x04,
    /// 64-bit float.
    Float = 0x05,

    // Blobs (Tag + u32 Len + Bytes)
    String = 0x10,
    Bytes = 0x11,

    // Containers (Tag + u32 Len + Body)
    List = 0x20,
    Map = 0x21,
    Entry = 0x22,
}

impl Tag {
    /// Returns the Tag variant for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Tag::Nil),
            0x02 => Some(Tag::True),
            0x03 => Some(Tag::False),
            0x04 => Some(Tag::Int),
            0x05 => Some(Tag::Float),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x20 => Some(Tag::List),
            0x21 => Some(Tag::Map),
            0x22 => Some(Tag::Entry),
            _ => None,
        }
    }
}

/// Internal state tracking for the `Encoder` stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The virtual root; allows any number of items.
    Root,
    /// Ordered sequence; allows any number of items.
    List,
    /// Key-Value container; strictly allows only `Tag::Entry` items.
    Map,
    /// A single key-value pair; allows exactly one item after the key.
    Entry,
}

/// An active container scope on the `Encoder` stack.
struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A state-machine driven encoder.
///
/// The Encoder keeps a stack of open scopes and back-patches the length
/// header of each container when it is closed.
///
/// # Structural Invariants
///
/// 1.  **Map Scopes**: Only entries may be written.
/// 2.  **Entry Scopes**: Exactly one value must follow the key.
/// 3.  **Root Scope**: The encoder must end in the Root scope to finalize bytes.
pub struct Encoder {
    buf: Vec<u8>,
    /// Bottom is always `Scope::Root`.
    stack: Vec<Frame>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Creates a new encoder with default capacity.
    pub fn new() -> Self {
        let mut enc = Self {
            buf: Vec::with_capacity(256),
            stack: Vec::with_capacity(8),
        };
        enc.stack.push(Frame { start: 0, scope: Scope::Root, count: 0 });
        enc
    }

    /// Consumes the encoder and returns the final byte vector.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if any container is still open.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    /// Number of bytes written so far, including open containers.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn current_frame(&mut self) -> &mut Frame {
        // The root frame is never popped, see `end_scope`.
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.current_frame();
        match frame.scope {
            Scope::Root | Scope::List => Ok(()),
            Scope::Map if tag == Tag::Entry => Ok(()),
            Scope::Map => Err(Error::InvalidMapEntry),
            Scope::Entry if frame.count >= 1 => Err(Error::TooManyItems),
            Scope::Entry => Ok(()),
        }
    }

    fn on_item_written(&mut self) {
        self.current_frame().count += 1;
    }

    fn write_tag(&mut self, tag: Tag) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        Ok(())
    }

    fn write_blob(&mut self, tag: Tag, v: &[u8]) -> Result<()> {
        let len = v.len();
        if len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(len));
        }
        self.write_tag(tag)?;
        self.buf.extend_from_slice(&(len as u32).to_le_bytes());
        self.buf.extend_from_slice(v);
        self.on_item_written();
        Ok(())
    }

    fn begin_scope(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.check_write(tag)?;

        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0, 0, 0, 0]); // Length placeholder

        self.stack.push(Frame { start: self.buf.len(), scope, count: 0 });
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }

        let frame = self.current_frame();
        if frame.scope != expected {
            return Err(Error::ScopeMismatch { expected, actual: frame.scope });
        }
        if frame.scope == Scope::Entry && frame.count == 0 {
            return Err(Error::EmptyEntry);
        }

        let start = frame.start;
        self.stack.truncate(self.stack.len() - 1);
        let body_len = self.buf.len() - start;
        if body_len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(body_len));
        }

        self.buf[start - 4..start].copy_from_slice(&(body_len as u32).to_le_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Encodes nil.
    pub fn nil(&mut self) -> Result<()> {
        self.write_tag(Tag::Nil)?;
        self.on_item_written();
        Ok(())
    }

    /// Encodes a boolean value.
    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.write_tag(if v { Tag::True } else { Tag::False })?;
        self.on_item_written();
        Ok(())
    }

    /// Encodes a signed 64-bit integer (LE).
    pub fn int(&mut self, v: i64) -> Result<()> {
        self.write_tag(Tag::Int)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Encodes a 64-bit float (LE).
    pub fn float(&mut self, v: f64) -> Result<()> {
        self.write_tag(Tag::Float)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Encodes a UTF-8 string blob.
    pub fn str(&mut self, v: &str) -> Result<()> {
        self.write_blob(Tag::String, v.as_bytes())
    }

    /// Encodes a raw byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.write_blob(Tag::Bytes, v)
    }

    /// Begins a List container. Must be closed via `list_end()`.
    pub fn list_begin(&mut self) -> Result<()> { self.begin_scope(Tag::List, Scope::List) }
    /// Ends a List container.
    pub fn list_end(&mut self) -> Result<()> { self.end_scope(Scope::List) }

    /// Begins a Map container. Only `entry_begin()` is allowed as a direct child.
    pub fn map_begin(&mut self) -> Result<()> { self.begin_scope(Tag::Map, Scope::Map) }
    /// Ends a Map container.
    pub fn map_end(&mut self) -> Result<()> { self.end_scope(Scope::Map) }

    /// Begins a map entry and writes its key.
    ///
    /// Exactly one value must be written before `entry_end()`.
    pub fn entry_begin(&mut self, key: &str) -> Result<()> {
        self.begin_scope(Tag::Entry, Scope::Entry)?;
        let len = key.len();
        if len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(len));
        }
        // The key is metadata, it does not count towards the entry's single value.
        self.buf.push(Tag::String as u8);
        self.buf.extend_from_slice(&(len as u32).to_le_bytes());
        self.buf.extend_from_slice(key.as_bytes());
        Ok(())
    }
    /// Ends a map entry.
    pub fn entry_end(&mut self) -> Result<()> { self.end_scope(Scope::Entry) }
}

/// A zero-copy, bounds-checked cursor over a byte slice.
///
/// Reading advances the internal cursor. Container reads return new
/// `Decoder` instances restricted to the container's body.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the remaining bytes in the view.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Peeks the next Tag without advancing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let b = *self.buf.first().ok_or(Error::UnexpectedEnd)?;
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?) as usize)
    }

    fn check_tag(&mut self, expected: Tag) -> Result<()> {
        let tag = self.peek_tag()?;
        if tag != expected {
            return Err(Error::InvalidTag(tag as u8));
        }
        self.consume(1)
    }

    /// Skips the next item and its nested children.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.consume(1)?;

        match tag {
            Tag::Nil | Tag::True | Tag::False => {}
            Tag::Int | Tag::Float => self.consume(8)?,
            Tag::String | Tag::Bytes | Tag::List | Tag::Map | Tag::Entry => {
                let len = self.read_len()?;
                self.consume(len)?;
            }
        }
        Ok(())
    }

    /// Decodes nil.
    pub fn nil(&mut self) -> Result<()> { self.check_tag(Tag::Nil) }

    /// Decodes a bool.
    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::True => { self.consume(1)?; Ok(true) }
            Tag::False => { self.consume(1)?; Ok(false) }
            tag => Err(Error::InvalidTag(tag as u8)),
        }
    }

    /// Decodes a signed 64-bit integer.
    pub fn int(&mut self) -> Result<i64> {
        self.check_tag(Tag::Int)?;
        Ok(i64::from_le_bytes(self.read_array::<8>()?))
    }

    /// Decodes a 64-bit float.
    pub fn float(&mut self) -> Result<f64> {
        self.check_tag(Tag::Float)?;
        Ok(f64::from_le_bytes(self.read_array::<8>()?))
    }

    /// Decodes a string slice (UTF-8).
    pub fn str(&mut self) -> Result<&'a str> {
        self.check_tag(Tag::String)?;
        let len = self.read_len()?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a byte slice.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.check_tag(Tag::Bytes)?;
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    fn enter_container(&mut self, expected: Tag) -> Result<Decoder<'a>> {
        self.check_tag(expected)?;
        let len = self.read_len()?;
        Ok(Decoder::new(self.read_bytes(len)?))
    }

    /// Decodes a List into an iterator over item decoders.
    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter_container(Tag::List)? })
    }

    /// Decodes a Map into an iterator over `(key, value decoder)` pairs.
    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter_container(Tag::Map)? })
    }

    /// Decodes a single map entry, returning `(Key, ValueDecoder)`.
    pub fn entry(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter_container(Tag::Entry)?;
        let key = inner.str()?;
        Ok((key, inner))
    }
}

/// Iterator for items within a List.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns a Decoder for the next item, or `None` when the list is exhausted.
    pub fn next_item(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let mut probe = self.dec.clone();
        probe.skip()?;
        let len = self.dec.remaining() - probe.remaining();
        Ok(Some(Decoder::new(self.dec.read_bytes(len)?)))
    }
}

/// Iterator for Key-Value pairs within a Map.
#[derive(Debug)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    /// Returns `(Key, ValueDecoder)` for the next entry, or `None`.
    pub fn next_entry(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let tag = self.dec.peek_tag()?;
        if tag != Tag::Entry {
            return Err(Error::InvalidTag(tag as u8));
        }
        self.dec.entry().map(Some)
    }
}
