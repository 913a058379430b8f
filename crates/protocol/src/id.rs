//! Interaction id allocation.

use rand::Rng;
use rand::distributions::Alphanumeric;
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates interaction ids as `prefix + monotonic counter`.
///
/// Ids are generated by the initiator of an interaction and never reused.
/// The server side uses the fixed [`SERVER_PREFIX`]; clients default to a
/// random per-instance token so two clients sharing a server do not collide.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: String,
    counter: AtomicU64,
}

/// Fixed id prefix for server-initiated interactions.
pub const SERVER_PREFIX: &str = "server_";

impl IdGenerator {
    /// Create a generator with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Create a generator with a random per-instance prefix.
    #[must_use]
    pub fn random() -> Self {
        Self::new(random_prefix())
    }

    /// The prefix this generator stamps onto every id.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{n}", self.prefix)
    }
}

/// A short random token followed by `_`, the default client prefix.
#[must_use]
pub fn random_prefix() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{}_", token.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_monotonic() {
        let ids = IdGenerator::new("server_");
        assert_eq!(ids.next_id(), "server_0");
        assert_eq!(ids.next_id(), "server_1");
        assert_eq!(ids.next_id(), "server_2");
    }

    #[test]
    fn random_prefix_ends_with_separator() {
        let prefix = random_prefix();
        assert!(prefix.ends_with('_'));
        assert_eq!(prefix.len(), 7);
        assert_ne!(random_prefix(), prefix);
    }
}
