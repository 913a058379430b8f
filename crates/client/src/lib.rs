//! Client engine of the duplex streaming RPC substrate.
//!
//! A [`Client`] encodes outbound value streams into protocol messages over
//! a lazily opened connection, demultiplexes inbound messages to
//! per-interaction response streams, and by symmetry serves inbound FIRST
//! messages against its own connector registry, so a server can call into
//! connected clients through the very same protocol.

pub mod client;

pub use client::{Client, ClientOptions, ConnectionStatus};
