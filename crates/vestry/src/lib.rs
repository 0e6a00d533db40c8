//! Vestry backend library.
//!
//! Propagates change notifications from mutation handlers to connected
//! clients: the push hub fans events out over long-lived event streams,
//! the HTTP API exposes the stream and the publish interface.

pub mod api;
pub mod hub;
pub mod settings;
