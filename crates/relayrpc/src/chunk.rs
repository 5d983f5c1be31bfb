//! # Chunked Transfer
//!
//! Messages larger than `max_message_buffer_size` are not sent directly.
//! The sender opens an entry in the receiver's `message_cache`, appends the
//! encoded bytes in order, then asks the receiver to `process` the entry,
//! which reassembles it and dispatches it as if it had arrived whole.
//!
//! ```text
//! create(id, heartbeat) -> append(id, chunk)* -> process(id)
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::Result;
use crate::error::RpcError;
use crate::session::Timer;

/// Size of one appended chunk.
pub const CHUNK_SIZE: usize = 500 * 1024;

pub const DEFAULT_MAX_MESSAGE_BUFFER_SIZE: usize = CHUNK_SIZE + 1024;

/// Whether an encoded message of `len` bytes must take the chunked path.
pub fn should_chunk(len: usize, max_message_buffer_size: usize) -> bool {
    len > max_message_buffer_size
}

/// Splits `data` into at most `CHUNK_SIZE` pieces, never larger than the
/// configured message limit.
pub fn chunks(data: &[u8], max_message_buffer_size: usize) -> std::slice::Chunks<'_, u8> {
    data.chunks(CHUNK_SIZE.min(max_message_buffer_size).max(1))
}

struct CacheEntry {
    owner: String,
    data: Vec<u8>,
    watchdog: Option<Timer>,
}

/// Receiver-side storage of partially transferred messages.
#[derive(Clone, Default)]
pub struct MessageCache {
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an entry owned by `owner`. With `idle` set, the entry is dropped
    /// if no append arrives within that window. An id held by another peer
    /// is refused; the owner may open it again from scratch.
    pub fn create(&self, id: &str, owner: &str, idle: Option<Duration>) -> Result<()> {
        let slot = self.entries.entry(id.to_string());
        if let Entry::Occupied(held) = &slot {
            if held.get().owner != owner {
                return Err(RpcError::Permission(format!("message {id} belongs to another peer")));
            }
        }
        let watchdog = idle.map(|window| {
            let entries = Arc::downgrade(&self.entries);
            let key = id.to_string();
            let holder = owner.to_string();
            Timer::start(window, move || {
                if let Some(entries) = entries.upgrade() {
                    tracing::warn!(message_id = %key, owner = %holder, "message cache entry expired");
                    entries.remove_if(&key, |_, entry| entry.owner == holder);
                }
            })
        });
        slot.insert(CacheEntry { owner: owner.to_string(), data: Vec::new(), watchdog });
        Ok(())
    }

    pub fn append(&self, id: &str, owner: &str, chunk: &[u8]) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| RpcError::NotFound(format!("message {id}")))?;
        if entry.owner != owner {
            return Err(RpcError::Permission(format!("message {id} belongs to another peer")));
        }
        entry.data.extend_from_slice(chunk);
        if let Some(watchdog) = &entry.watchdog {
            watchdog.reset();
        }
        Ok(())
    }

    /// Removes the entry and returns the reassembled bytes.
    pub fn take(&self, id: &str, owner: &str) -> Result<Vec<u8>> {
        let (_, entry) = self
            .entries
            .remove_if(id, |_, entry| entry.owner == owner)
            .ok_or_else(|| RpcError::NotFound(format!("message {id} for {owner}")))?;
        Ok(entry.data)
    }

    /// Drops an entry without dispatching it. Only its owner may do so.
    pub fn remove(&self, id: &str, owner: &str) -> bool {
        self.entries.remove_if(id, |_, entry| entry.owner == owner).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
