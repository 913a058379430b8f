//! Transport error type.

use thiserror::Error;

/// Errors surfaced by transport implementations.
///
/// These never propagate into application-visible response streams; the
/// engines log them and reflect connection loss through the connection
/// status value only.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Establishing the connection failed.
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    /// The connection is closed.
    #[error("Connection closed")]
    Closed,

    /// A message could not be queued for delivery.
    #[error("Failed to deliver message: {0}")]
    Send(String),
}
