//! Client engine implementation.

use dashmap::DashMap;
use duplex_protocol::{
    ConnectorRegistry, IdGenerator, Message, MessageContent, ProtocolFault, StreamItem,
    ValueStream, forward_responses, id,
};
use duplex_transport::{ClientTransport, Connection, EventStream, TransportEvent};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection status surfaced to callers.
///
/// Transport loss never errors response streams; callers needing to tell
/// "peer finished" from "network dropped" watch this value alongside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection is established.
    NotConnected,
    /// The transport is attempting to re-establish a lost connection.
    Reconnecting,
    /// The connection is up.
    Connected,
}

/// Construction parameters for [`Client`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Prefix stamped onto interaction ids generated by this client.
    /// Defaults to a random per-instance token followed by `_`.
    pub messages_prefix: Option<String>,
}

/// The client engine.
///
/// Interactions opened with [`Client::send`] and interactions opened by the
/// peer share one demultiplexing table keyed by interaction id; the routing
/// of NEXT/ERROR/END into a waiting sink is identical for both directions.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client over `transport`, serving inbound calls from
    /// `registry`.
    ///
    /// Nothing is connected yet: the connection opens on demand when the
    /// first outbound message exists.
    pub fn new(
        transport: impl ClientTransport,
        registry: Arc<ConnectorRegistry>,
        options: ClientOptions,
    ) -> Self {
        let prefix = options.messages_prefix.unwrap_or_else(id::random_prefix);
        let (status, _) = watch::channel(ConnectionStatus::NotConnected);
        Self {
            inner: Arc::new(ClientInner {
                transport: Arc::new(transport),
                registry,
                ids: IdGenerator::new(prefix),
                listeners: DashMap::new(),
                status,
                pipeline: Mutex::new(None),
            }),
        }
    }

    /// Invoke the peer's `subject` connector with a stream of request
    /// values; the returned stream carries the peer's responses.
    ///
    /// Lazy end to end: the connection opens only once `outbound` yields
    /// its first item. An empty producer (zero values, immediate
    /// completion) never opens a connection and never emits any message.
    /// Protocol-level failures are never raised from this call; they
    /// arrive as an error event on the returned stream or are absorbed.
    pub fn send(
        &self,
        subject: impl Into<String>,
        outbound: impl Stream<Item = StreamItem> + Send + 'static,
    ) -> ValueStream {
        let inner = Arc::clone(&self.inner);
        let subject = subject.into();
        let id = inner.ids.next_id();

        let (sink, responses) = mpsc::unbounded_channel();
        inner.listeners.insert(id.clone(), sink);
        debug!(%id, %subject, "opening outbound interaction");

        let queue = ClientInner::queue(&inner);
        tokio::spawn(async move {
            let mut outbound = pin!(outbound);
            let mut first_sent = false;
            while let Some(item) = outbound.next().await {
                let message = match item {
                    Ok(value) if first_sent => Message::next(id.as_str(), value),
                    Ok(value) => {
                        first_sent = true;
                        Message::first(id.as_str(), subject.as_str(), value)
                    }
                    Err(error) => {
                        let message = if first_sent {
                            Message::error(id.as_str(), error)
                        } else {
                            Message::first_error(id.as_str(), subject.as_str(), error)
                        };
                        let _ = queue.send(message);
                        return;
                    }
                };
                if queue.send(message).is_err() {
                    return;
                }
            }
            if first_sent {
                let _ = queue.send(Message::end(id.as_str()));
            }
        });

        Box::pin(UnboundedReceiverStream::new(responses))
    }

    /// Watch the connection status. Initially
    /// [`ConnectionStatus::NotConnected`].
    #[must_use]
    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Cancel the outbound pipeline, close the transport and clear the
    /// connection handle; the next [`Client::send`] reopens fresh. Every
    /// open interaction completes gracefully.
    pub fn disconnect(&self) {
        info!("disconnecting client");
        let pipeline = self.inner.pipeline.lock().take();
        if let Some(pipeline) = pipeline {
            pipeline.cancel.cancel();
        }
        self.inner.listeners.clear();
        self.inner.status.send_replace(ConnectionStatus::NotConnected);
    }
}

struct ClientInner {
    transport: Arc<dyn ClientTransport>,
    registry: Arc<ConnectorRegistry>,
    ids: IdGenerator,
    listeners: DashMap<String, mpsc::UnboundedSender<StreamItem>>,
    status: watch::Sender<ConnectionStatus>,
    pipeline: Mutex<Option<Pipeline>>,
}

struct Pipeline {
    queue: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

/// Connection state of the outbound pipeline.
enum Link {
    NotConnected,
    Connected(Arc<dyn Connection>),
}

impl ClientInner {
    /// The active outbound queue, arming a fresh pipeline if none is live.
    /// Only called from `send`; replies and faults go through `enqueue`,
    /// which never arms a pipeline on its own.
    fn queue(this: &Arc<Self>) -> mpsc::UnboundedSender<Message> {
        let mut pipeline = this.pipeline.lock();
        if let Some(active) = pipeline.as_ref() {
            if !active.queue.is_closed() {
                return active.queue.clone();
            }
        }
        let (queue, outbox) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(Self::run_pipeline(Arc::clone(this), outbox, cancel.clone()));
        *pipeline = Some(Pipeline {
            queue: queue.clone(),
            cancel,
        });
        queue
    }

    /// Queue a reply on the live pipeline, if any. After `disconnect`
    /// there is none and the message is dropped.
    fn enqueue(&self, message: Message) {
        let queue = self.pipeline.lock().as_ref().map(|p| p.queue.clone());
        match queue {
            Some(queue) => {
                if queue.send(message).is_err() {
                    debug!("outbound pipeline gone, message dropped");
                }
            }
            None => debug!("no outbound pipeline, message dropped"),
        }
    }

    /// Drives queued messages onto the wire. The connection is opened on
    /// the first message, never earlier: `NotConnected` moves to
    /// `Connected` through the one `connect` call in here.
    async fn run_pipeline(
        inner: Arc<Self>,
        mut outbox: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
    ) {
        let mut link = Link::NotConnected;
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                received = outbox.recv() => match received {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Link::NotConnected = link {
                match inner.transport.connect().await {
                    Ok((connection, events)) => {
                        debug!("connection established");
                        tokio::spawn(Self::run_dispatch(
                            Arc::clone(&inner),
                            events,
                            cancel.child_token(),
                        ));
                        link = Link::Connected(connection);
                    }
                    Err(error) => {
                        warn!(%error, kind = %message.kind(), "connect failed, dropping message");
                        continue;
                    }
                }
            }
            if let Link::Connected(connection) = &link {
                if let Err(error) = connection.emit(message) {
                    warn!(%error, "failed to emit message");
                }
            }
        }
        if let Link::Connected(connection) = link {
            connection.close();
        }
    }

    /// Routes transport events; inbound messages demultiplex by id.
    async fn run_dispatch(inner: Arc<Self>, mut events: EventStream, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            Self::on_event(&inner, event);
        }
    }

    fn on_event(this: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected | TransportEvent::Reconnected => {
                this.set_status(ConnectionStatus::Connected);
            }
            TransportEvent::ReconnectAttempt => this.set_status(ConnectionStatus::Reconnecting),
            TransportEvent::ReconnectFailed | TransportEvent::Closed => {
                this.set_status(ConnectionStatus::NotConnected);
            }
            TransportEvent::Message(message) => Self::dispatch_message(this, message),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn dispatch_message(this: &Arc<Self>, message: Message) {
        let Message { id, content } = message;

        let sink = this.listeners.get(&id).map(|entry| entry.value().clone());
        if let Some(sink) = sink {
            match content {
                MessageContent::First { body, .. } | MessageContent::Next { body } => {
                    let _ = sink.send(Ok(body));
                }
                MessageContent::FirstError { error, .. } | MessageContent::Error { error } => {
                    let _ = sink.send(Err(error));
                    this.listeners.remove(&id);
                }
                MessageContent::End => {
                    this.listeners.remove(&id);
                }
            }
            return;
        }

        match content {
            MessageContent::First { subject, body } => {
                Self::serve_incoming(this, id, subject, Ok(body));
            }
            MessageContent::FirstError { subject, error } => {
                Self::serve_incoming(this, id, subject, Err(error));
            }
            MessageContent::Next { .. } | MessageContent::End => {
                debug!(%id, "continuation for unknown interaction");
                this.enqueue(ProtocolFault::Undeliverable(id.clone()).reply(&id));
            }
            // Replying to an unroutable ERROR with another ERROR would
            // bounce between peers indefinitely.
            MessageContent::Error { error } => {
                warn!(%id, ?error, "dropping error for unknown interaction");
            }
        }
    }

    /// Peer symmetry: an inbound FIRST with no waiting sink is an incoming
    /// call against this client's own registry.
    fn serve_incoming(this: &Arc<Self>, id: String, subject: String, seed: StreamItem) {
        let Some(connector) = this.registry.get_connector(&subject) else {
            debug!(%id, %subject, "no connector for incoming interaction");
            this.enqueue(ProtocolFault::ConnectorNotFound(subject).reply(&id));
            return;
        };

        debug!(%id, %subject, "serving incoming interaction");
        let reply = seed.is_ok();
        let (sink, requests) = mpsc::unbounded_channel();
        if reply {
            this.listeners.insert(id.clone(), sink.clone());
        }
        let responses = connector.on_message(Box::pin(UnboundedReceiverStream::new(requests)));

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let emitter = Arc::clone(&inner);
            forward_responses(responses, &id, reply, move |m| emitter.enqueue(m)).await;
            inner.listeners.remove(&id);
        });

        let _ = sink.send(seed);
    }
}
