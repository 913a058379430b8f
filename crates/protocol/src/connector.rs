//! The connector capability.

use crate::stream::ValueStream;

/// A named handler capability transforming a request stream into a
/// response stream.
///
/// Connectors serve every cardinality uniformly: a unary handler consumes
/// one request value and yields one response before completing; streaming
/// handlers consume and produce as many values as they need. The request
/// stream ends when the remote producer completed (END) or the owning
/// connection dropped; an `Err` item means the remote producer errored.
pub trait Connector: Send + Sync + 'static {
    /// Transform the interaction's request stream into its response stream.
    fn on_message(&self, requests: ValueStream) -> ValueStream;
}

impl<F> Connector for F
where
    F: Fn(ValueStream) -> ValueStream + Send + Sync + 'static,
{
    fn on_message(&self, requests: ValueStream) -> ValueStream {
        self(requests)
    }
}
