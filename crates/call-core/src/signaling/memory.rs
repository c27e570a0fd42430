//! In-process signaling port
//!
//! [`MemorySignalingPort`] is handed to a session controller; the matching
//! [`MemorySignalingRemote`] plays the part of the pairing server. Useful for
//! tests and for embedding the core behind a transport that already lives
//! in-process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CallError, CallResult};
use crate::signaling::{SignalingMessage, SignalingPort, SignalingStream};

/// Client side of an in-memory signaling channel
pub struct MemorySignalingPort {
    inbound_rx: Mutex<Option<mpsc::Receiver<SignalingMessage>>>,
    outbound_tx: mpsc::UnboundedSender<SignalingMessage>,
    connected: Arc<AtomicBool>,
}

/// Server side of an in-memory signaling channel
pub struct MemorySignalingRemote {
    inbound_tx: mpsc::Sender<SignalingMessage>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingMessage>>,
    connected: Arc<AtomicBool>,
}

impl MemorySignalingPort {
    /// Create a connected port and its remote end
    pub fn pair(capacity: usize) -> (Self, MemorySignalingRemote) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let port = Self {
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            connected: connected.clone(),
        };
        let remote = MemorySignalingRemote {
            inbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            connected,
        };
        (port, remote)
    }
}

#[async_trait]
impl SignalingPort for MemorySignalingPort {
    async fn publish(&self, message: SignalingMessage) -> CallResult<()> {
        if !self.is_connected() {
            return Err(CallError::transport("memory signaling channel is disconnected"));
        }
        debug!(kind = message.kind(), "memory port publish");
        self.outbound_tx
            .send(message)
            .map_err(|_| CallError::transport("memory signaling remote dropped"))
    }

    fn subscribe(&self) -> CallResult<SignalingStream> {
        self.inbound_rx
            .lock()
            .take()
            .ok_or_else(|| CallError::invalid_state("memory signaling port already subscribed"))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl MemorySignalingRemote {
    /// Deliver a message to the client
    pub async fn deliver(&self, message: SignalingMessage) -> CallResult<()> {
        self.inbound_tx
            .send(message)
            .await
            .map_err(|_| CallError::transport("memory signaling port dropped"))
    }

    /// Wait for the next message the client published
    pub async fn next_published(&self) -> Option<SignalingMessage> {
        self.outbound_rx.lock().await.recv().await
    }

    /// Wait up to `wait` for the next published message
    pub async fn next_published_within(&self, wait: Duration) -> Option<SignalingMessage> {
        tokio::time::timeout(wait, self.next_published()).await.ok().flatten()
    }

    /// Drain everything published so far without waiting
    pub async fn drain_published(&self) -> Vec<SignalingMessage> {
        let mut rx = self.outbound_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    /// Simulate the channel dropping
    pub async fn disconnect(&self) -> CallResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.deliver(SignalingMessage::TransportDisconnected).await
    }

    /// Simulate the channel coming back
    pub async fn reconnect(&self) -> CallResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        self.deliver(SignalingMessage::TransportConnected).await
    }
}
