//! Server-initiated fan-out across a dynamic membership set.

use crate::engine::{EngineInner, ServerEngine};
use duplex_protocol::{Message, StreamItem};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One event collected from a broadcast target's reply stream.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastReply {
    /// Connection the event originated from.
    pub connection_id: String,
    /// What the target signalled.
    pub event: ReplyEvent,
}

/// Reply stream event of a single broadcast target.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    /// The target produced a response value.
    Value(Value),
    /// The target's reply stream terminated with an error.
    Error(Value),
    /// The target's reply stream completed.
    End,
}

impl BroadcastReply {
    pub(crate) fn value(connection_id: &str, value: Value) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            event: ReplyEvent::Value(value),
        }
    }

    pub(crate) fn error(connection_id: &str, error: Value) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            event: ReplyEvent::Error(error),
        }
    }

    pub(crate) fn end(connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            event: ReplyEvent::End,
        }
    }
}

impl ServerEngine {
    /// Push `outbound` to a dynamic set of connected clients as one
    /// broadcast session, collecting every target's reply stream into the
    /// returned stream.
    ///
    /// `membership` carries complete snapshots, not deltas: an empty
    /// snapshot means "all currently connected", a non-empty one is an
    /// explicit allow-list. Until the first snapshot arrives the sentinel
    /// applies. A target removed by a snapshot after receiving its FIRST
    /// gets one END; removed before its FIRST it is dropped silently. A
    /// target joining mid-stream receives the next outbound value as its
    /// own FIRST.
    pub fn send_message(
        &self,
        subject: impl Into<String>,
        outbound: impl Stream<Item = StreamItem> + Send + 'static,
        membership: impl Stream<Item = Vec<String>> + Send + 'static,
    ) -> UnboundedReceiverStream<BroadcastReply> {
        let (replies, collector) = mpsc::unbounded_channel();
        let session = SessionDriver {
            engine: Arc::clone(&self.inner),
            id: self.inner.ids.next_id(),
            subject: subject.into(),
            replies,
            mode: TargetMode::All,
            targets: HashMap::new(),
        };
        let cancel = self.inner.stop.lock().child_token();
        tokio::spawn(session.run(outbound, membership, cancel));
        UnboundedReceiverStream::new(collector)
    }

    /// Push `outbound` to all currently connected clients.
    pub fn send_to_all(
        &self,
        subject: impl Into<String>,
        outbound: impl Stream<Item = StreamItem> + Send + 'static,
    ) -> UnboundedReceiverStream<BroadcastReply> {
        self.send_message(subject, outbound, futures::stream::empty())
    }

    /// Hard stop: cancel every active broadcast session process-wide.
    ///
    /// No END is sent to remote targets; this is a kill switch, not a
    /// graceful drain. Collector streams complete immediately.
    pub fn stop_service(&self) {
        info!("stopping all broadcast sessions");
        let mut stop = self.inner.stop.lock();
        stop.cancel();
        *stop = CancellationToken::new();
    }
}

enum TargetMode {
    /// Sentinel: resolve to all connected clients at each send.
    All,
    /// Explicit allow-list from the latest membership snapshot.
    Explicit(Vec<String>),
}

#[derive(Default)]
struct TargetState {
    first_sent: bool,
    terminated: bool,
}

/// Owns all bookkeeping of one broadcast session; runs as a single task so
/// membership diffs and outbound values never race each other.
struct SessionDriver {
    engine: Arc<EngineInner>,
    id: String,
    subject: String,
    replies: mpsc::UnboundedSender<BroadcastReply>,
    mode: TargetMode,
    targets: HashMap<String, TargetState>,
}

impl SessionDriver {
    async fn run(
        mut self,
        outbound: impl Stream<Item = StreamItem> + Send,
        membership: impl Stream<Item = Vec<String>> + Send,
        cancel: CancellationToken,
    ) {
        debug!(id = %self.id, subject = %self.subject, "broadcast session started");
        let mut outbound = pin!(outbound.fuse());
        let mut membership = pin!(membership.fuse());
        let mut membership_done = false;
        loop {
            tokio::select! {
                // Snapshots queued ahead of a value must apply before it.
                biased;
                () = cancel.cancelled() => {
                    debug!(id = %self.id, "broadcast session cancelled");
                    self.teardown(false);
                    return;
                }
                snapshot = membership.next(), if !membership_done => {
                    match snapshot {
                        Some(snapshot) => self.apply_snapshot(snapshot),
                        None => membership_done = true,
                    }
                }
                item = outbound.next() => match item {
                    Some(Ok(value)) => self.emit_value(&value),
                    Some(Err(error)) => {
                        self.emit_error(&error);
                        self.teardown(false);
                        return;
                    }
                    None => {
                        self.teardown(true);
                        return;
                    }
                },
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: Vec<String>) {
        if snapshot.is_empty() {
            debug!(id = %self.id, "membership snapshot: all connected");
            self.mode = TargetMode::All;
            return;
        }
        let keep: HashSet<&String> = snapshot.iter().collect();
        let dropped: Vec<String> = self
            .targets
            .keys()
            .filter(|target| !keep.contains(target))
            .cloned()
            .collect();
        for target in dropped {
            let Some(state) = self.targets.remove(&target) else {
                continue;
            };
            // Removed before its FIRST: silently dropped.
            if state.first_sent && !state.terminated {
                debug!(id = %self.id, %target, "target left membership, completing");
                self.emit_to(&target, Message::end(self.id.as_str()));
                self.engine.remove_interaction(&target, &self.id);
            }
        }
        self.mode = TargetMode::Explicit(snapshot);
    }

    fn emit_value(&mut self, value: &Value) {
        for target in self.live_targets() {
            let first_sent = {
                let state = self.targets.entry(target.clone()).or_default();
                if state.terminated {
                    continue;
                }
                state.first_sent
            };
            if first_sent {
                self.emit_to(&target, Message::next(self.id.as_str(), value.clone()));
            } else if self.engine.register_broadcast_route(
                &target,
                &self.id,
                self.replies.clone(),
            ) {
                self.emit_to(
                    &target,
                    Message::first(self.id.as_str(), self.subject.as_str(), value.clone()),
                );
                if let Some(state) = self.targets.get_mut(&target) {
                    state.first_sent = true;
                }
            }
        }
    }

    fn emit_error(&mut self, error: &Value) {
        for target in self.live_targets() {
            let first_sent = {
                let state = self.targets.entry(target.clone()).or_default();
                if state.terminated {
                    continue;
                }
                state.terminated = true;
                state.first_sent
            };
            if first_sent {
                self.emit_to(&target, Message::error(self.id.as_str(), error.clone()));
            } else {
                // The peer opens this interaction already closed and never
                // replies, so no reply route is registered.
                self.emit_to(
                    &target,
                    Message::first_error(self.id.as_str(), self.subject.as_str(), error.clone()),
                );
            }
        }
    }

    /// Complete the session: with `graceful`, every target holding an open
    /// FIRST gets an END. Reply routes are deregistered either way, and
    /// dropping `self` completes the collector stream.
    fn teardown(&mut self, graceful: bool) {
        for (target, state) in std::mem::take(&mut self.targets) {
            if !state.first_sent {
                continue;
            }
            if graceful && !state.terminated {
                self.emit_to(&target, Message::end(self.id.as_str()));
            }
            self.engine.remove_interaction(&target, &self.id);
        }
        debug!(id = %self.id, "broadcast session finished");
    }

    /// The membership resolved at send time.
    fn live_targets(&self) -> Vec<String> {
        match &self.mode {
            TargetMode::All => self
                .engine
                .connections
                .iter()
                .map(|entry| entry.key().clone())
                .collect(),
            TargetMode::Explicit(list) => list.clone(),
        }
    }

    fn emit_to(&self, target: &str, message: Message) {
        let handle = self
            .engine
            .connections
            .get(target)
            .map(|state| Arc::clone(&state.handle));
        match handle {
            Some(handle) => {
                if let Err(error) = handle.emit(message) {
                    debug!(id = %self.id, %target, %error, "failed to emit to target");
                }
            }
            None => debug!(id = %self.id, %target, "target not connected, message dropped"),
        }
    }
}
