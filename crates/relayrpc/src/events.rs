//! Named local events: `service-updated`, `disconnect`, `busy`, `ready`, and
//! any inbound message whose type the dispatcher does not handle itself.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::value::Value;

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by [`EventBus::on`], used to remove one handler.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct EventBus {
    handlers: DashMap<String, Vec<(HandlerId, EventHandler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes one handler, or every handler of `event` when `id` is `None`.
    pub fn off(&self, event: &str, id: Option<HandlerId>) {
        match id {
            None => {
                self.handlers.remove(event);
            }
            Some(id) => {
                if let Some(mut list) = self.handlers.get_mut(event) {
                    list.retain(|(h, _)| *h != id);
                }
            }
        }
    }

    /// Calls every handler of `event`. Handlers run outside the table lock,
    /// so they may register or remove handlers themselves.
    pub fn emit(&self, event: &str, value: &Value) {
        let handlers: Vec<EventHandler> = match self.handlers.get(event) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };
        tracing::debug!(event, handlers = handlers.len(), "emit");
        for handler in handlers {
            handler(value);
        }
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }
}
