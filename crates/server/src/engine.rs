//! Connection tables, routing and interaction lifecycle.

use crate::broadcast::BroadcastReply;
use dashmap::DashMap;
use duplex_protocol::{
    ConnectorRegistry, IdGenerator, Message, MessageContent, ProtocolFault, SERVER_PREFIX,
    StreamItem, forward_responses,
};
use duplex_transport::ConnectionHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The server engine.
///
/// Cheap to clone; all clones share the same registry, connection tables
/// and broadcast sessions.
#[derive(Clone)]
pub struct ServerEngine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) registry: Arc<ConnectorRegistry>,
    pub(crate) connections: DashMap<String, ConnectionState>,
    pub(crate) ids: IdGenerator,
    /// Parent token of every broadcast session; `stop_service` cancels and
    /// replaces it.
    pub(crate) stop: Mutex<CancellationToken>,
}

/// Per-connection state: the emit handle plus one table of open
/// interactions. Interactions served by a connector and reply routes of
/// broadcast sessions share the table as tagged variants, so a continuation
/// resolves to exactly one route without a secondary lookup.
pub(crate) struct ConnectionState {
    pub(crate) handle: Arc<dyn ConnectionHandle>,
    pub(crate) interactions: HashMap<String, InteractionRoute>,
}

pub(crate) enum InteractionRoute {
    /// An inbound call whose FIRST arrived on this connection.
    Connector(ConnectorInteraction),
    /// The reply path of a broadcast session targeting this connection.
    Broadcast(BroadcastRoute),
}

pub(crate) struct ConnectorInteraction {
    /// Feeds the connector's request stream. Dropping it completes the
    /// stream gracefully.
    sink: mpsc::UnboundedSender<StreamItem>,
}

pub(crate) struct BroadcastRoute {
    pub(crate) replies: mpsc::UnboundedSender<BroadcastReply>,
}

impl ServerEngine {
    /// Create an engine serving connectors from `registry`.
    #[must_use]
    pub fn new(registry: Arc<ConnectorRegistry>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                connections: DashMap::new(),
                ids: IdGenerator::new(SERVER_PREFIX),
                stop: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Register a connection before it has spoken, so broadcasts can reach
    /// it. Connections are otherwise registered lazily on their first
    /// inbound message.
    pub fn handle_connect(&self, client: Arc<dyn ConnectionHandle>) {
        debug!(connection = client.id(), "connection registered");
        self.inner.ensure_connection(&client);
    }

    /// Open an interaction from a FIRST or FIRST-ERROR message.
    ///
    /// The connector is looked up exactly once, here; it serves the whole
    /// interaction. A FIRST-ERROR opens the interaction already closed: the
    /// handler's request stream receives the error, but whatever the
    /// handler emits is dropped rather than sent back: the requester
    /// already knows the call failed and must not receive any success
    /// response.
    pub fn handle_first_message(&self, message: Message, client: Arc<dyn ConnectionHandle>) {
        let Message { id, content } = message;
        let (subject, seed) = match content {
            MessageContent::First { subject, body } => (subject, Ok(body)),
            MessageContent::FirstError { subject, error } => (subject, Err(error)),
            other => {
                warn!(kind = %other.kind(), "continuation passed to the first-message entry point");
                return;
            }
        };

        let Some(connector) = self.inner.registry.get_connector(&subject) else {
            debug!(connection = client.id(), %id, %subject, "no connector for subject");
            let fault = ProtocolFault::ConnectorNotFound(subject);
            if let Err(error) = client.emit(fault.reply(&id)) {
                debug!(%error, "failed to reply with routing fault");
            }
            return;
        };

        debug!(connection = client.id(), %id, %subject, "opening interaction");
        let reply = seed.is_ok();
        let (sink, requests) = mpsc::unbounded_channel();
        if reply {
            let mut state = self.inner.ensure_connection(&client);
            state.interactions.insert(
                id.clone(),
                InteractionRoute::Connector(ConnectorInteraction { sink: sink.clone() }),
            );
        }

        let responses = connector.on_message(Box::pin(UnboundedReceiverStream::new(requests)));
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let emitter = Arc::clone(&client);
            forward_responses(responses, &id, reply, move |reply_message| {
                if let Err(error) = emitter.emit(reply_message) {
                    debug!(%error, "failed to emit interaction reply");
                }
            })
            .await;
            inner.remove_interaction(client.id(), &id);
        });

        let _ = sink.send(seed);
    }

    /// Route a NEXT continuation.
    pub fn handle_next_message(&self, message: Message, client: Arc<dyn ConnectionHandle>) {
        self.handle_continuation(message, &client);
    }

    /// Route an ERROR continuation.
    pub fn handle_error_message(&self, message: Message, client: Arc<dyn ConnectionHandle>) {
        self.handle_continuation(message, &client);
    }

    /// Route an END continuation.
    pub fn handle_end_message(&self, message: Message, client: Arc<dyn ConnectionHandle>) {
        self.handle_continuation(message, &client);
    }

    /// Uniform continuation path: resolve by (connection, interaction id)
    /// and feed the route; unknown ids get a correlation ERROR reply and
    /// never create an interaction.
    fn handle_continuation(&self, message: Message, client: &Arc<dyn ConnectionHandle>) {
        let Message { id, content } = message;
        let kind = content.kind();
        if self.inner.route_continuation(client.id(), &id, content) {
            return;
        }
        debug!(connection = client.id(), %id, %kind, "continuation for unknown interaction");
        let fault = ProtocolFault::UnknownInteraction(id.clone());
        if let Err(error) = client.emit(fault.reply(&id)) {
            debug!(%error, "failed to reply with correlation fault");
        }
    }

    /// Tear down a connection: every still-open connector interaction
    /// completes gracefully, never errors, so a network drop is not
    /// mistaken for a domain failure. Broadcast reply routes on the
    /// connection complete their target's reply stream.
    pub fn handle_disconnect(&self, connection_id: &str) {
        let Some((_, state)) = self.inner.connections.remove(connection_id) else {
            debug!(connection = connection_id, "disconnect for unknown connection");
            return;
        };
        info!(
            connection = connection_id,
            interactions = state.interactions.len(),
            "connection closed"
        );
        for route in state.interactions.into_values() {
            match route {
                // Dropping the sink completes the request stream.
                InteractionRoute::Connector(interaction) => drop(interaction),
                InteractionRoute::Broadcast(route) => {
                    let _ = route.replies.send(BroadcastReply::end(connection_id));
                }
            }
        }
    }
}

impl EngineInner {
    fn ensure_connection(
        &self,
        client: &Arc<dyn ConnectionHandle>,
    ) -> dashmap::mapref::one::RefMut<'_, String, ConnectionState> {
        self.connections
            .entry(client.id().to_string())
            .or_insert_with(|| ConnectionState {
                handle: Arc::clone(client),
                interactions: HashMap::new(),
            })
    }

    /// Feed `content` into the route registered under `(connection_id, id)`.
    /// Returns false when no such route exists.
    fn route_continuation(&self, connection_id: &str, id: &str, content: MessageContent) -> bool {
        let Some(mut state) = self.connections.get_mut(connection_id) else {
            return false;
        };
        let Some(route) = state.interactions.get(id) else {
            return false;
        };
        let remove = match (route, content) {
            (InteractionRoute::Connector(interaction), MessageContent::Next { body }) => {
                let _ = interaction.sink.send(Ok(body));
                false
            }
            (InteractionRoute::Connector(interaction), MessageContent::Error { error }) => {
                let _ = interaction.sink.send(Err(error));
                true
            }
            (InteractionRoute::Connector(_), MessageContent::End) => true,
            (InteractionRoute::Broadcast(route), MessageContent::Next { body }) => {
                let _ = route.replies.send(BroadcastReply::value(connection_id, body));
                false
            }
            (InteractionRoute::Broadcast(route), MessageContent::Error { error }) => {
                let _ = route.replies.send(BroadcastReply::error(connection_id, error));
                true
            }
            (InteractionRoute::Broadcast(route), MessageContent::End) => {
                let _ = route.replies.send(BroadcastReply::end(connection_id));
                true
            }
            (_, other) => {
                warn!(kind = %other.kind(), "opening message in the continuation path");
                false
            }
        };
        if remove {
            state.interactions.remove(id);
        }
        true
    }

    pub(crate) fn remove_interaction(&self, connection_id: &str, id: &str) {
        if let Some(mut state) = self.connections.get_mut(connection_id) {
            state.interactions.remove(id);
        }
    }

    /// Register the reply route of a broadcast session on a target
    /// connection. Returns false when the target is not connected.
    pub(crate) fn register_broadcast_route(
        &self,
        connection_id: &str,
        id: &str,
        replies: mpsc::UnboundedSender<BroadcastReply>,
    ) -> bool {
        let Some(mut state) = self.connections.get_mut(connection_id) else {
            return false;
        };
        state.interactions.insert(
            id.to_string(),
            InteractionRoute::Broadcast(BroadcastRoute { replies }),
        );
        true
    }
}
