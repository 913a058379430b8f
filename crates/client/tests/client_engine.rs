//! Client engine tests over the in-memory transport.

use duplex_client::{Client, ClientOptions, ConnectionStatus};
use duplex_protocol::{ConnectorRegistry, Message, ValueStream, boxed};
use duplex_transport_memory::{MemoryHub, MemoryPeer};
use futures::{StreamExt, stream};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;

const WAIT: Duration = Duration::from_secs(1);
const QUIET: Duration = Duration::from_millis(200);

fn new_client(hub: &Arc<MemoryHub>, registry: Arc<ConnectorRegistry>) -> Client {
    let _ = tracing_subscriber::fmt::try_init();
    Client::new(
        hub.client_transport("A"),
        registry,
        ClientOptions {
            messages_prefix: Some("c_".to_string()),
        },
    )
}

async fn accept(hub: &MemoryHub) -> MemoryPeer {
    timeout(WAIT, hub.accept())
        .await
        .expect("no connection arrived")
        .expect("hub closed")
}

async fn recv(peer: &mut MemoryPeer) -> Message {
    timeout(WAIT, peer.recv())
        .await
        .expect("no message arrived")
        .expect("connection closed")
}

async fn assert_quiet(peer: &mut MemoryPeer) {
    assert!(
        timeout(QUIET, peer.recv()).await.is_err(),
        "unexpected message"
    );
}

fn echo(requests: ValueStream) -> ValueStream {
    requests
}

#[tokio::test]
async fn empty_producer_never_opens_a_connection() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));

    let _responses = client.send("type", stream::empty());

    assert!(
        timeout(QUIET, hub.accept()).await.is_err(),
        "a connection was opened for an empty producer"
    );
}

#[tokio::test]
async fn producer_of_n_values_emits_first_then_next_then_end() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));

    let _responses = client.send(
        "type",
        stream::iter([Ok(json!("a")), Ok(json!("b")), Ok(json!("c"))]),
    );

    let mut peer = accept(&hub).await;
    assert_eq!(recv(&mut peer).await, Message::first("c_0", "type", json!("a")));
    assert_eq!(recv(&mut peer).await, Message::next("c_0", json!("b")));
    assert_eq!(recv(&mut peer).await, Message::next("c_0", json!("c")));
    assert_eq!(recv(&mut peer).await, Message::end("c_0"));
    assert_quiet(&mut peer).await;
}

#[tokio::test]
async fn producer_error_before_any_value_sends_first_error() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));

    let _responses = client.send("type", stream::iter([Err(json!("boom"))]));

    let mut peer = accept(&hub).await;
    assert_eq!(
        recv(&mut peer).await,
        Message::first_error("c_0", "type", json!("boom"))
    );
    assert_quiet(&mut peer).await;
}

#[tokio::test]
async fn producer_error_after_a_value_sends_error() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));

    let _responses = client.send(
        "type",
        stream::iter([Ok(json!("a")), Err(json!("boom"))]),
    );

    let mut peer = accept(&hub).await;
    assert_eq!(recv(&mut peer).await, Message::first("c_0", "type", json!("a")));
    assert_eq!(recv(&mut peer).await, Message::error("c_0", json!("boom")));
    assert_quiet(&mut peer).await;
}

#[tokio::test]
async fn responses_route_to_the_calling_interaction() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));

    let mut responses = client.send("echo", stream::iter([Ok(json!("titi"))]));
    let mut peer = accept(&hub).await;
    assert_eq!(
        recv(&mut peer).await,
        Message::first("c_0", "echo", json!("titi"))
    );
    assert_eq!(recv(&mut peer).await, Message::end("c_0"));

    peer.send(Message::next("c_0", json!("titi"))).unwrap();
    peer.send(Message::end("c_0")).unwrap();

    assert_eq!(
        timeout(WAIT, responses.next()).await.unwrap(),
        Some(Ok(json!("titi")))
    );
    assert_eq!(timeout(WAIT, responses.next()).await.unwrap(), None);
}

#[tokio::test]
async fn error_response_errors_the_stream_and_removes_the_interaction() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));

    let (producer, requests) = mpsc::unbounded_channel();
    producer.send(Ok(json!("q"))).unwrap();
    let mut responses = client.send("type", UnboundedReceiverStream::new(requests));

    let mut peer = accept(&hub).await;
    assert_eq!(recv(&mut peer).await, Message::first("c_0", "type", json!("q")));

    peer.send(Message::error("c_0", json!("boom"))).unwrap();
    assert_eq!(
        timeout(WAIT, responses.next()).await.unwrap(),
        Some(Err(json!("boom")))
    );
    assert_eq!(timeout(WAIT, responses.next()).await.unwrap(), None);
}

#[tokio::test]
async fn incoming_call_is_served_from_the_registry() {
    let hub = MemoryHub::new();
    let registry = Arc::new(ConnectorRegistry::new());
    registry.register("echo", echo);
    let client = new_client(&hub, Arc::clone(&registry));

    // Open the connection; the peer ignores this interaction.
    let _responses = client.send("noop", stream::iter([Ok(json!(0))]));
    let mut peer = accept(&hub).await;
    assert_eq!(recv(&mut peer).await, Message::first("c_0", "noop", json!(0)));
    assert_eq!(recv(&mut peer).await, Message::end("c_0"));

    peer.send(Message::first("server_0", "echo", json!("toto")))
        .unwrap();
    peer.send(Message::next("server_0", json!("titi"))).unwrap();
    peer.send(Message::end("server_0")).unwrap();

    assert_eq!(
        recv(&mut peer).await,
        Message::next("server_0", json!("toto"))
    );
    assert_eq!(
        recv(&mut peer).await,
        Message::next("server_0", json!("titi"))
    );
    assert_eq!(recv(&mut peer).await, Message::end("server_0"));
}

#[tokio::test]
async fn incoming_call_for_unknown_connector_replies_not_found() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));

    let _responses = client.send("noop", stream::iter([Ok(json!(0))]));
    let mut peer = accept(&hub).await;
    assert_eq!(recv(&mut peer).await, Message::first("c_0", "noop", json!(0)));
    assert_eq!(recv(&mut peer).await, Message::end("c_0"));

    peer.send(Message::first("server_0", "missing", json!(1)))
        .unwrap();
    assert_eq!(
        recv(&mut peer).await,
        Message::error("server_0", json!("Connector missing not found"))
    );
}

#[tokio::test]
async fn incoming_first_error_suppresses_handler_output() {
    let hub = MemoryHub::new();
    let registry = Arc::new(ConnectorRegistry::new());
    registry.register("echo", |_requests: ValueStream| {
        boxed(stream::iter([Ok(json!("nope"))]))
    });
    let client = new_client(&hub, Arc::clone(&registry));

    let _responses = client.send("noop", stream::iter([Ok(json!(0))]));
    let mut peer = accept(&hub).await;
    assert_eq!(recv(&mut peer).await, Message::first("c_0", "noop", json!(0)));
    assert_eq!(recv(&mut peer).await, Message::end("c_0"));

    peer.send(Message::first_error("server_0", "echo", json!("boom")))
        .unwrap();
    assert_quiet(&mut peer).await;
}

#[tokio::test]
async fn unknown_continuation_replies_cannot_be_delivered() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));

    let _responses = client.send("noop", stream::iter([Ok(json!(0))]));
    let mut peer = accept(&hub).await;
    assert_eq!(recv(&mut peer).await, Message::first("c_0", "noop", json!(0)));
    assert_eq!(recv(&mut peer).await, Message::end("c_0"));

    peer.send(Message::next("zzz", json!(1))).unwrap();
    assert_eq!(
        recv(&mut peer).await,
        Message::error("zzz", json!("Message zzz cannot be delivered"))
    );
}

#[tokio::test]
async fn unknown_error_is_dropped_without_a_reply() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));

    let _responses = client.send("noop", stream::iter([Ok(json!(0))]));
    let mut peer = accept(&hub).await;
    assert_eq!(recv(&mut peer).await, Message::first("c_0", "noop", json!(0)));
    assert_eq!(recv(&mut peer).await, Message::end("c_0"));

    peer.send(Message::error("zzz", json!("boom"))).unwrap();
    assert_quiet(&mut peer).await;
}

#[tokio::test]
async fn status_follows_connection_events() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));
    let mut status = client.connection_status();
    assert_eq!(*status.borrow(), ConnectionStatus::NotConnected);

    let _responses = client.send("type", stream::iter([Ok(json!(0))]));
    let peer = accept(&hub).await;

    timeout(WAIT, status.changed()).await.unwrap().unwrap();
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Connected);

    peer.disconnect();
    timeout(WAIT, status.changed()).await.unwrap().unwrap();
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::NotConnected);
}

#[tokio::test]
async fn disconnect_completes_interactions_and_the_next_send_reopens() {
    let hub = MemoryHub::new();
    let client = new_client(&hub, Arc::new(ConnectorRegistry::new()));

    let (producer, requests) = mpsc::unbounded_channel();
    producer.send(Ok(json!("q"))).unwrap();
    let mut responses = client.send("type", UnboundedReceiverStream::new(requests));

    let mut peer = accept(&hub).await;
    assert_eq!(recv(&mut peer).await, Message::first("c_0", "type", json!("q")));

    client.disconnect();

    // Graceful completion, not an error.
    assert_eq!(timeout(WAIT, responses.next()).await.unwrap(), None);
    assert!(timeout(WAIT, peer.recv()).await.unwrap().is_none());

    let _responses = client.send("type", stream::iter([Ok(json!("again"))]));
    let mut fresh = accept(&hub).await;
    assert_eq!(
        recv(&mut fresh).await,
        Message::first("c_1", "type", json!("again"))
    );
}
