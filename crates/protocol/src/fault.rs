//! Protocol-level faults.

use crate::message::Message;
use thiserror::Error;

/// Faults recovered locally and reported to the offending peer as an ERROR
/// reply. These never reach application code: `send()` callers observe them
/// as an error event on the response stream of the interaction they belong
/// to, if they observe them at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolFault {
    /// No connector is registered for the requested subject.
    #[error("Connector {0} not found")]
    ConnectorNotFound(String),

    /// A continuation referenced an interaction id that was never opened on
    /// this connection, or that already terminated.
    #[error("First message with id {0} never received")]
    UnknownInteraction(String),

    /// A message correlated with no open interaction and could not open one.
    #[error("Message {0} cannot be delivered")]
    Undeliverable(String),
}

impl ProtocolFault {
    /// The ERROR reply carrying this fault, addressed to interaction `id`.
    #[must_use]
    pub fn reply(&self, id: &str) -> Message {
        Message::error(id, self.to_string())
    }
}
