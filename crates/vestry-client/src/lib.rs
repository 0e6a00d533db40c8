//! Client primitives for Vestry live updates.
//!
//! Three pieces, layered so the polling subscription is the source of
//! truth and everything else only cuts its latency:
//!
//! - [`env`]: platform capabilities (connectivity, shared signal store)
//!   behind an injectable trait, so the rest is testable without the
//!   real runtime.
//! - [`relay`]: fans mutation signals out to sibling contexts through
//!   the shared store.
//! - [`poll`]: the resilient polling subscription that refetches on an
//!   interval, on relay signals, on reconnect, and on demand.
//! - [`stream`]: a reconnecting consumer of the server's event stream.

pub mod env;
pub mod poll;
pub mod relay;
pub mod stream;

pub use env::{EnvError, Environment, FsEnvironment, MemoryContext, MemoryEnvironment, StoreWrite};
pub use poll::{FetchError, PollConfig, PollStatus, PolledResource, ResourceSnapshot};
pub use relay::{Relay, SignalObserver};
pub use stream::{ConnectionState, UpdateListener};
