//! In-memory transport implementation for testing
//!
//! Routes protocol messages between a client engine and a server harness
//! within the same process, perfect for tests and local development. A
//! [`MemoryHub`] plays the listening side: client transports created from
//! it register a [`MemoryPeer`] on connect, and the harness drives the
//! server engine from the peer's inbound queue.

use async_trait::async_trait;
use duplex_protocol::Message;
use duplex_transport::{
    ClientTransport, Connection, ConnectionHandle, EventStream, TransportError, TransportEvent,
};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use uuid::Uuid;

enum PeerSignal {
    Message(Message),
    Disconnected,
}

/// In-process switchboard pairing client transports with server peers.
pub struct MemoryHub {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

impl MemoryHub {
    /// Create a new hub.
    pub fn new() -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
        })
    }

    /// Create a client transport whose connection will carry `connection_id`.
    pub fn client_transport(&self, connection_id: impl Into<String>) -> MemoryClientTransport {
        MemoryClientTransport {
            connection_id: connection_id.into(),
            accept_tx: self.accept_tx.clone(),
        }
    }

    /// Create a client transport with a random connection id.
    pub fn anonymous_client_transport(&self) -> MemoryClientTransport {
        self.client_transport(Uuid::new_v4().to_string())
    }

    /// Accept the next connecting peer, waiting until one connects.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.accept_rx.lock().await.recv().await
    }
}

/// Client transport backed by in-process channels.
///
/// `connect` is cheap and performs no I/O until called, matching the
/// demand-driven connection opening of the client engine.
#[derive(Debug, Clone)]
pub struct MemoryClientTransport {
    connection_id: String,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

#[async_trait]
impl ClientTransport for MemoryClientTransport {
    async fn connect(&self) -> Result<(Arc<dyn Connection>, EventStream), TransportError> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(MemoryConnection {
            id: self.connection_id.clone(),
            signals: signal_tx,
            closed: AtomicBool::new(false),
        });
        let peer = MemoryPeer {
            handle: Arc::new(MemoryHandle {
                id: self.connection_id.clone(),
                events: event_tx.clone(),
                closed: AtomicBool::new(false),
            }),
            incoming: signal_rx,
        };

        // The connect event precedes anything the peer may send.
        let _ = event_tx.send(TransportEvent::Connected);

        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed("hub is gone".to_string()))?;

        debug!(connection_id = %self.connection_id, "memory connection established");

        Ok((
            connection,
            Box::pin(UnboundedReceiverStream::new(event_rx)),
        ))
    }
}

struct MemoryConnection {
    id: String,
    signals: mpsc::UnboundedSender<PeerSignal>,
    closed: AtomicBool,
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .finish()
    }
}

impl Connection for MemoryConnection {
    fn emit(&self, message: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.signals
            .send(PeerSignal::Message(message))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(connection_id = %self.id, "closing memory connection");
            let _ = self.signals.send(PeerSignal::Disconnected);
        }
    }
}

/// Server side of an accepted in-memory connection.
pub struct MemoryPeer {
    handle: Arc<MemoryHandle>,
    incoming: mpsc::UnboundedReceiver<PeerSignal>,
}

impl MemoryPeer {
    /// The connection id the client transport was created with.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.handle.id
    }

    /// The [`ConnectionHandle`] a server engine emits through.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn ConnectionHandle> {
        let handle: Arc<dyn ConnectionHandle> = self.handle.clone();
        handle
    }

    /// Receive the next message emitted by the client. `None` once the
    /// client closed or dropped the connection.
    pub async fn recv(&mut self) -> Option<Message> {
        match self.incoming.recv().await? {
            PeerSignal::Message(message) => Some(message),
            PeerSignal::Disconnected => None,
        }
    }

    /// Deliver a message to the client.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        self.handle.emit(message)
    }

    /// Drop the connection from the server side: the client observes a
    /// `Closed` event and further emits in either direction fail.
    pub fn disconnect(&self) {
        if !self.handle.closed.swap(true, Ordering::AcqRel) {
            debug!(connection_id = %self.handle.id, "disconnecting memory peer");
            let _ = self.handle.events.send(TransportEvent::Closed);
        }
    }
}

struct MemoryHandle {
    id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
}

impl Debug for MemoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHandle").field("id", &self.id).finish()
    }
}

impl ConnectionHandle for MemoryHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn emit(&self, message: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.events
            .send(TransportEvent::Message(message))
            .map_err(|_| TransportError::Closed)
    }
}
