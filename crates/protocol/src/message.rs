//! Wire message model.
//!
//! Every protocol exchange is a [`Message`]: an interaction id plus
//! kind-specific content. Payload values are opaque [`serde_json::Value`]s
//! and are passed through unvalidated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The five message kinds, named as they appear on the wire.
///
/// Transports deliver messages as named discrete events; [`MessageKind::as_str`]
/// yields the event name a transport subscribes to and emits under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Opens an interaction, carrying the operation name and the first value.
    First,
    /// Opens an interaction whose producer errored before yielding a value.
    FirstError,
    /// A continuation value within an open interaction.
    Next,
    /// Graceful termination of an interaction.
    End,
    /// Error termination of an interaction.
    Error,
}

impl MessageKind {
    /// All kinds, in wire-subscription order.
    pub const ALL: [Self; 5] = [
        Self::First,
        Self::FirstError,
        Self::Next,
        Self::End,
        Self::Error,
    ];

    /// The wire event name for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::First => "first-message",
            Self::FirstError => "first-error-message",
            Self::Next => "next-message",
            Self::End => "end-message",
            Self::Error => "error-message",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific content of a protocol message.
///
/// Serialized with an internal `type` tag matching [`MessageKind::as_str`],
/// so the wire shape is `{"type": "next-message", "body": ...}` etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageContent {
    /// Opens an interaction: operation name plus the first produced value.
    #[serde(rename = "first-message")]
    First {
        /// Operation name resolved against the peer's connector registry.
        subject: String,
        /// First produced value.
        body: Value,
    },
    /// Opens an interaction whose producer errored before any value; the
    /// peer still learns the intended operation name.
    #[serde(rename = "first-error-message")]
    FirstError {
        /// Operation name resolved against the peer's connector registry.
        subject: String,
        /// The producer's error, carried opaquely.
        error: Value,
    },
    /// A continuation value.
    #[serde(rename = "next-message")]
    Next {
        /// The produced value.
        body: Value,
    },
    /// Graceful termination.
    #[serde(rename = "end-message")]
    End,
    /// Error termination, or a protocol-level fault reply.
    #[serde(rename = "error-message")]
    Error {
        /// The error, carried opaquely.
        error: Value,
    },
}

impl MessageContent {
    /// The kind tag of this content.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::First { .. } => MessageKind::First,
            Self::FirstError { .. } => MessageKind::FirstError,
            Self::Next { .. } => MessageKind::Next,
            Self::End => MessageKind::End,
            Self::Error { .. } => MessageKind::Error,
        }
    }
}

/// A protocol message: the interaction id it belongs to plus its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Interaction id, generated by the initiator.
    pub id: String,
    /// Kind-specific content.
    pub content: MessageContent,
}

impl Message {
    /// Build a FIRST message.
    pub fn first(id: impl Into<String>, subject: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            content: MessageContent::First {
                subject: subject.into(),
                body,
            },
        }
    }

    /// Build a FIRST-ERROR message.
    pub fn first_error(id: impl Into<String>, subject: impl Into<String>, error: Value) -> Self {
        Self {
            id: id.into(),
            content: MessageContent::FirstError {
                subject: subject.into(),
                error,
            },
        }
    }

    /// Build a NEXT message.
    pub fn next(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            content: MessageContent::Next { body },
        }
    }

    /// Build an END message.
    pub fn end(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: MessageContent::End,
        }
    }

    /// Build an ERROR message.
    pub fn error(id: impl Into<String>, error: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            content: MessageContent::Error {
                error: error.into(),
            },
        }
    }

    /// The kind tag of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.content.kind()
    }
}
