//! Canonical wire types shared by the Vestry server and client crates.

mod events;
mod signals;

pub use events::{CONNECTED_EVENT, HEARTBEAT_TEXT, UpdateEvent};
pub use signals::{SIGNAL_KEY_PREFIX, SIGNAL_TTL, Signal, parse_signal_key};
