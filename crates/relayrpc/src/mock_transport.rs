//! Mock transports for testing.
//!
//! Used by the test suites of this crate and of code built on it.

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportError;

/// A duplex channel transport using tokio mpsc channels.
///
/// Messages sent via `send()` appear on the other end's `recv()` and vice
/// versa. The size of every sent payload is recorded for inspection.
pub struct DuplexChannelTransport {
    tx: SyncMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    sent: Arc<SyncMutex<Vec<usize>>>,
}

impl DuplexChannelTransport {
    /// Creates a new transport from separate tx and rx channels.
    pub fn new(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            tx: SyncMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            sent: Arc::new(SyncMutex::new(Vec::new())),
        }
    }

    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }

    /// A shared view of the sizes of all payloads sent so far. Stays valid
    /// after the transport is moved into a peer.
    pub fn sent_sizes(&self) -> Arc<SyncMutex<Vec<usize>>> {
        self.sent.clone()
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| TransportError::ConnectionLost("transport disconnected".into()))?;
        tx.send(payload.to_vec())
            .map_err(|_| TransportError::ConnectionLost("channel closed".into()))?;
        self.sent.lock().push(payload.len());
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn disconnect(&self, _reason: Option<&str>) {
        // Dropping the sender ends the other side's stream.
        self.tx.lock().take();
    }
}
