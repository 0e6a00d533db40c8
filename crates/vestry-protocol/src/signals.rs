//! Cross-context relay signals and their shared-store key convention.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix shared by every relay store key; unrelated keys are ignored by
/// observers.
pub const SIGNAL_KEY_PREFIX: &str = "admin-update-";

/// How long a signal entry stays in the shared store before its writer
/// removes it. Bounds storage growth; delivery past this window is not
/// attempted.
pub const SIGNAL_TTL: Duration = Duration::from_millis(1000);

/// One advisory change notification relayed between sibling contexts.
///
/// The payload is a trigger to re-fetch authoritative state from the
/// persistence layer, never the state itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Entity kind that changed.
    #[serde(rename = "type")]
    pub kind: String,
    /// Advisory payload.
    #[serde(default)]
    pub payload: Value,
    /// Emission time in epoch milliseconds.
    pub timestamp: i64,
}

impl Signal {
    /// Build a signal stamped with the current wall clock.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Shared-store key for this signal: `admin-update-<type>-<epoch-ms>`.
    ///
    /// The timestamp salt keeps repeated signals of the same kind from
    /// colliding in the store.
    pub fn key(&self) -> String {
        format!("{SIGNAL_KEY_PREFIX}{}-{}", self.kind, self.timestamp)
    }
}

/// Parse a shared-store key written under the relay convention.
///
/// Returns the signal kind and timestamp salt, or `None` for keys that do
/// not follow the convention.
pub fn parse_signal_key(key: &str) -> Option<(&str, i64)> {
    let rest = key.strip_prefix(SIGNAL_KEY_PREFIX)?;
    let (kind, salt) = rest.rsplit_once('-')?;
    if kind.is_empty() {
        return None;
    }
    let timestamp = salt.parse().ok()?;
    Some((kind, timestamp))
}
