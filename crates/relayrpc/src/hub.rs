//! # In-Process Hub
//!
//! A routing table of peer queues keyed by wire identity. Each peer connects
//! under its own address and gets a [`HubTransport`]; a send is delivered to
//! whichever queue is registered under the main segment's `to` field.
//!
//! ## Invariants
//!
//! - An address is registered by `connect` and deregistered by `disconnect`
//!   (or by dropping the transport). Nothing else touches the table.
//! - The hub reads the `to` field only; payloads are forwarded untouched.
//! - A reconnection token lives with its route and goes away with it.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::message::peek_destination;
use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportError;

/// A registered queue, tagged with the connection that owns it.
struct Route {
    connection: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    token: Option<String>,
}

/// Shared routing table. Cheap to clone.
#[derive(Clone, Default)]
pub struct Hub {
    routes: Arc<DashMap<String, Route>>,
    next_connection: Arc<AtomicU64>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address` and returns its transport. Fails if the address
    /// is already taken.
    pub fn connect(&self, address: impl Into<String>) -> transport::Result<HubTransport> {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        match self.routes.entry(address.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::Io(format!("address {address} already connected")));
            }
            Entry::Vacant(slot) => {
                slot.insert(Route { connection, tx, token: None });
            }
        }
        tracing::debug!(%address, "hub connect");
        Ok(HubTransport {
            address,
            connection,
            hub: self.clone(),
            rx: Mutex::new(rx),
        })
    }

    pub fn contains(&self, address: &str) -> bool {
        self.routes.contains_key(address)
    }

    /// The reconnection token last installed by the peer at `address`.
    pub fn reconnection_token(&self, address: &str) -> Option<String> {
        self.routes.get(address).and_then(|r| r.token.clone())
    }

    fn store_token(&self, address: &str, connection: u64, token: &str) {
        if let Some(mut route) = self.routes.get_mut(address) {
            if route.connection == connection {
                route.token = Some(token.to_string());
            }
        }
    }

    fn route(&self, payload: &[u8]) -> transport::Result<()> {
        let to = peek_destination(payload).map_err(|e| TransportError::Io(e.to_string()))?;
        let route = self
            .routes
            .get(&to)
            .map(|r| r.tx.clone())
            .ok_or_else(|| TransportError::ConnectionLost(format!("no route to {to}")))?;
        route
            .send(payload.to_vec())
            .map_err(|_| TransportError::ConnectionLost(format!("{to} went away")))
    }

    fn deregister(&self, address: &str, connection: u64) {
        if self.routes.remove_if(address, |_, r| r.connection == connection).is_some() {
            tracing::debug!(%address, "hub disconnect");
        }
    }
}

/// One peer's connection to a [`Hub`].
pub struct HubTransport {
    address: String,
    connection: u64,
    hub: Hub,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl HubTransport {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The last reconnection token installed by the peer.
    pub fn reconnection_token(&self) -> Option<String> {
        self.hub.reconnection_token(&self.address)
    }
}

#[async_trait::async_trait]
impl Transport for HubTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        self.hub.route(payload)
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn disconnect(&self, _reason: Option<&str>) {
        self.hub.deregister(&self.address, self.connection);
    }

    fn supports_reconnection_token(&self) -> bool {
        true
    }

    fn set_reconnection_token(&self, token: &str) {
        self.hub.store_token(&self.address, self.connection, token);
    }
}

impl Drop for HubTransport {
    fn drop(&mut self) {
        self.hub.deregister(&self.address, self.connection);
    }
}
