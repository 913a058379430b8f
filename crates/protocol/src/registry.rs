//! Name-to-connector mapping.

use crate::connector::Connector;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Concurrency-safe mapping from operation name to connector.
///
/// Owned per engine instance. At most one connector per name; the last
/// registration wins. Absence is a valid lookup outcome at this layer;
/// callers convert it into a protocol-level ERROR reply.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: DashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connector` under `subject`, silently overwriting any
    /// previous registration. Returns the registered handler.
    pub fn register(
        &self,
        subject: impl Into<String>,
        connector: impl Connector,
    ) -> Arc<dyn Connector> {
        let subject = subject.into();
        let connector: Arc<dyn Connector> = Arc::new(connector);
        debug!(%subject, "registering connector");
        self.connectors.insert(subject, Arc::clone(&connector));
        connector
    }

    /// Remove the connector registered under `subject`, returning it.
    pub fn unregister(&self, subject: &str) -> Option<Arc<dyn Connector>> {
        debug!(%subject, "unregistering connector");
        self.connectors.remove(subject).map(|(_, connector)| connector)
    }

    /// Look up the connector registered under `subject`.
    #[must_use]
    pub fn get_connector(&self, subject: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(subject).map(|entry| Arc::clone(entry.value()))
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("len", &self.connectors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ValueStream;

    fn echo(requests: ValueStream) -> ValueStream {
        requests
    }

    fn silent(requests: ValueStream) -> ValueStream {
        drop(requests);
        Box::pin(futures::stream::empty())
    }

    #[test]
    fn lookup_returns_most_recent_registration() {
        let registry = ConnectorRegistry::new();
        assert!(registry.get_connector("echo").is_none());

        let first = registry.register("echo", echo);
        assert!(Arc::ptr_eq(
            &first,
            &registry.get_connector("echo").unwrap()
        ));

        let second = registry.register("echo", silent);
        assert!(Arc::ptr_eq(
            &second,
            &registry.get_connector("echo").unwrap()
        ));
    }

    #[test]
    fn unregister_returns_previous_and_clears() {
        let registry = ConnectorRegistry::new();
        let registered = registry.register("echo", echo);

        let removed = registry.unregister("echo").unwrap();
        assert!(Arc::ptr_eq(&registered, &removed));
        assert!(registry.get_connector("echo").is_none());
        assert!(registry.unregister("echo").is_none());
    }
}
