//! # Reference Store
//!
//! An arena of ephemeral objects addressed by small integer handles.
//!
//! ## Invariants
//!
//! - `put` always returns the smallest free handle.
//! - A handle is fetched at most once; fetching one half of a pair releases
//!   both halves.
//! - The store reports its own transitions: [`StoreEvent::Busy`] when the
//!   first handle is taken, [`StoreEvent::Ready`] once when the last one is
//!   released. Callers emit them after releasing their lock.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// An occupancy transition of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Busy,
    Ready,
}

impl StoreEvent {
    pub fn name(self) -> &'static str {
        match self {
            StoreEvent::Busy => "busy",
            StoreEvent::Ready => "ready",
        }
    }
}

struct Slot<T> {
    value: T,
    pair: Option<u32>,
    owner: Option<String>,
}

pub struct RefStore<T> {
    slots: Vec<Option<Slot<T>>>,
    free: BinaryHeap<Reverse<u32>>,
    live: usize,
}

impl<T> RefStore<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BinaryHeap::new(),
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Stores a single-use value.
    pub fn put(&mut self, value: T) -> (u32, Option<StoreEvent>) {
        let was_empty = self.is_empty();
        let handle = self.insert(Slot { value, pair: None, owner: None });
        (handle, was_empty.then_some(StoreEvent::Busy))
    }

    /// Stores two linked values; fetching either releases both. `owner` tags
    /// the pair so it can later be released only by the one who made it.
    pub fn put_pair(&mut self, a: T, b: T, owner: Option<&str>) -> ((u32, u32), Option<StoreEvent>) {
        let was_empty = self.is_empty();
        let owner = owner.map(str::to_string);
        let ha = self.insert(Slot { value: a, pair: None, owner: owner.clone() });
        let hb = self.insert(Slot { value: b, pair: Some(ha), owner });
        if let Some(Some(slot)) = self.slots.get_mut(ha as usize) {
            slot.pair = Some(hb);
        }
        ((ha, hb), was_empty.then_some(StoreEvent::Busy))
    }

    /// Takes the value behind `handle`. `None` means unknown or already used.
    pub fn fetch(&mut self, handle: u32) -> (Option<T>, Option<StoreEvent>) {
        if self.slots.get(handle as usize).and_then(Option::as_ref).is_none() {
            return (None, None);
        }
        let value = self.take(handle).map(|slot| {
            if let Some(pair) = slot.pair {
                self.take(pair);
            }
            slot.value
        });
        (value, self.drained())
    }

    /// Drops a handle and its pair without fetching it. When `owner`
    /// is given, slots tagged with a different owner are left alone.
    pub fn release(&mut self, handle: u32, owner: Option<&str>) -> Option<StoreEvent> {
        let matches = match self.slots.get(handle as usize).and_then(Option::as_ref) {
            Some(slot) => owner.is_none() || slot.owner.as_deref() == owner,
            None => false,
        };
        if !matches {
            return None;
        }
        if let Some(slot) = self.take(handle) {
            if let Some(pair) = slot.pair {
                self.take(pair);
            }
        }
        self.drained()
    }

    /// Drops everything. Fires `Ready` if anything was held.
    pub fn clear(&mut self) -> Option<StoreEvent> {
        let was_busy = !self.is_empty();
        self.slots.clear();
        self.free.clear();
        self.live = 0;
        was_busy.then_some(StoreEvent::Ready)
    }

    fn insert(&mut self, slot: Slot<T>) -> u32 {
        self.live += 1;
        match self.free.pop() {
            Some(Reverse(handle)) => {
                self.slots[handle as usize] = Some(slot);
                handle
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn take(&mut self, handle: u32) -> Option<Slot<T>> {
        let slot = self.slots.get_mut(handle as usize)?.take()?;
        self.live -= 1;
        self.free.push(Reverse(handle));
        Some(slot)
    }

    fn drained(&self) -> Option<StoreEvent> {
        self.is_empty().then_some(StoreEvent::Ready)
    }
}

impl<T> Default for RefStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
