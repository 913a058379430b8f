//! Server engine of the duplex streaming RPC substrate.
//!
//! The [`ServerEngine`] routes inbound FIRST messages to registered
//! connectors, demultiplexes continuations by `(connection, interaction id)`
//! through per-connection interaction tables, and completes every open
//! interaction gracefully when a connection drops. Its broadcast half turns
//! one outbound value stream into independent per-target interactions
//! across a dynamic membership set and funnels all targets' responses into
//! one collector stream.
//!
//! A hosting integration layer drives the engine from transport events:
//! each inbound message kind maps onto one `handle_*` entry point, and the
//! transport's per-connection identity travels with every call.

pub mod broadcast;
pub mod engine;

pub use broadcast::{BroadcastReply, ReplyEvent};
pub use engine::ServerEngine;
