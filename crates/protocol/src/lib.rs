//! Core protocol model for the duplex streaming RPC substrate.
//!
//! This crate defines the wire message shapes, the logical value-stream
//! model shared by the client and server engines, the connector capability
//! trait with its registry, and interaction id allocation. It contains no
//! I/O: transports and engines live in sibling crates.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod connector;
pub mod fault;
pub mod id;
pub mod message;
pub mod registry;
pub mod stream;

pub use connector::Connector;
pub use fault::ProtocolFault;
pub use id::{IdGenerator, SERVER_PREFIX};
pub use message::{Message, MessageContent, MessageKind};
pub use registry::ConnectorRegistry;
pub use stream::{StreamItem, ValueStream, boxed, forward_responses};
