//! Event payloads broadcast by the push hub.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type of the handshake frame sent first on every stream connection.
pub const CONNECTED_EVENT: &str = "connected";

/// Text of the comment frame that keeps idle connections alive through
/// intermediary proxies.
pub const HEARTBEAT_TEXT: &str = "heartbeat";

/// One typed, timestamped notification fanned out to connected clients.
///
/// Events are self-describing and independently applicable: delivery is
/// at-most-once per channel and no ordering is guaranteed between events
/// published concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEvent {
    /// Entity kind that changed (e.g. `"sermon"`, `"gallery"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary payload describing the change.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Emission time in epoch milliseconds.
    pub timestamp: i64,
}

impl UpdateEvent {
    /// Build an event stamped with the current wall clock.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// The handshake event emitted before any published event.
    pub fn connected() -> Self {
        Self::new(CONNECTED_EVENT, Value::Null)
    }

    /// Whether this is the stream handshake frame.
    pub fn is_connected(&self) -> bool {
        self.kind == CONNECTED_EVENT
    }
}
