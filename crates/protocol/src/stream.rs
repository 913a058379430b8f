//! Logical value-stream model shared by the engines.
//!
//! An interaction carries three stream events: a value, a terminal error,
//! or graceful completion. They map onto a [`futures::Stream`] of
//! [`StreamItem`]: `Ok(value)` is a value, `Err(error)` is terminal, and the
//! end of the stream is completion. Consumers must treat an `Err` item as
//! the last meaningful event even if the stream yields further items.

use crate::message::Message;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;

/// One event of a logical value stream.
pub type StreamItem = Result<Value, Value>;

/// A boxed stream of opaque values with terminal-error semantics.
pub type ValueStream = Pin<Box<dyn Stream<Item = StreamItem> + Send>>;

/// Box a concrete stream into a [`ValueStream`].
pub fn boxed(stream: impl Stream<Item = StreamItem> + Send + 'static) -> ValueStream {
    Box::pin(stream)
}

/// Drain a handler's response stream into protocol replies for `id`.
///
/// Values become NEXT, a terminal error becomes ERROR, completion becomes
/// END. With `reply` false every emission is suppressed while the stream is
/// still fully drained; this serves interactions opened by FIRST-ERROR,
/// whose requester already knows the call failed and must not receive any
/// success response.
///
/// Returns once the stream reached a terminal event. The caller removes the
/// interaction from its table afterwards.
pub async fn forward_responses(
    mut responses: ValueStream,
    id: &str,
    reply: bool,
    emit: impl Fn(Message),
) {
    while let Some(item) = responses.next().await {
        match item {
            Ok(value) => {
                if reply {
                    emit(Message::next(id, value));
                }
            }
            Err(error) => {
                if reply {
                    emit(Message::error(id, error));
                }
                return;
            }
        }
    }
    if reply {
        emit(Message::end(id));
    }
}
