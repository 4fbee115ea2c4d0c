//! Event fan-out seam.
//!
//! Subsystems that publish events (schedulers, PTY sessions) depend on this
//! trait rather than on the gateway's connection registry, which implements
//! it. The `drop_if_slow` flag is honored by the implementation: a slow or
//! stuck consumer must never stall the publisher.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a single client connection, unique per connection lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub Uuid);

impl ConnId {
    /// Allocate a fresh connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sink for broadcast events.
pub trait EventSink: Send + Sync {
    /// Fan an event out to every connected client.
    fn broadcast(&self, event: &str, payload: Value, drop_if_slow: bool);

    /// Deliver an event only to the given connections.
    fn send_to(&self, conn_ids: &[ConnId], event: &str, payload: Value, drop_if_slow: bool);
}

/// Sink that discards everything. Used in tests and in contexts with no
/// connected clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn broadcast(&self, _event: &str, _payload: Value, _drop_if_slow: bool) {}

    fn send_to(&self, _conn_ids: &[ConnId], _event: &str, _payload: Value, _drop_if_slow: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_ids_are_unique() {
        assert_ne!(ConnId::new(), ConnId::new());
    }

    #[test]
    fn conn_id_serializes_as_uuid_string() {
        let id = ConnId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.contains('-'));
        let back: ConnId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
