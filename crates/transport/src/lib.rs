//! Transport adapter contract for the duplex protocol engines.
//!
//! This crate defines the boundary the engines program against. A transport
//! delivers named discrete messages over a persistent connection, signals
//! connection lifecycle events, and supplies a stable per-connection
//! identity on the server side. Framing, reconnection policy, heartbeats
//! and socket I/O are entirely the transport's concern; the engines never
//! see them.

pub mod error;

use async_trait::async_trait;
use duplex_protocol::Message;
use futures::Stream;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;

pub use error::TransportError;

/// Connection lifecycle and traffic events surfaced to the client engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection was established.
    Connected,
    /// The transport is attempting to re-establish a lost connection.
    ReconnectAttempt,
    /// A lost connection was re-established.
    Reconnected,
    /// The transport gave up re-establishing the connection.
    ReconnectFailed,
    /// The connection closed.
    Closed,
    /// A protocol message arrived.
    Message(Message),
}

/// Stream of transport events for one connection.
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Client-side factory for connections.
///
/// The client engine opens the connection on demand (on the first message it
/// has to send), so implementations must be cheap to construct and must not
/// touch the network before `connect` is called.
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    /// Establish the connection, returning an emit handle and the event
    /// stream. Reconnection attempts after a drop are reported on the event
    /// stream, not by calling `connect` again.
    async fn connect(&self) -> Result<(Arc<dyn Connection>, EventStream), TransportError>;
}

/// An established client-side connection.
pub trait Connection: Send + Sync + Debug {
    /// Queue a message for delivery. Fire-and-forget: the engines log a
    /// failed emit and carry on, they never block or retry here.
    fn emit(&self, message: Message) -> Result<(), TransportError>;

    /// Close the connection.
    fn close(&self);
}

/// Server-side view of one connected peer: its stable identity plus an
/// emit primitive. Supplied by the transport with every inbound message.
pub trait ConnectionHandle: Send + Sync + Debug {
    /// Stable per-connection identity.
    fn id(&self) -> &str;

    /// Queue a message for delivery to this peer. Fire-and-forget.
    fn emit(&self, message: Message) -> Result<(), TransportError>;
}
