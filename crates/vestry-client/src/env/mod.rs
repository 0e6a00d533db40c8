//! Platform capability abstraction.
//!
//! Connectivity state and the shared signal store are ambient globals in
//! the deployed platform. Hiding them behind a trait keeps the relay and
//! the polling subscription unit-testable without the real runtime, and
//! lets one process ([`MemoryEnvironment`]) or several
//! ([`FsEnvironment`]) share a store with the same semantics.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

mod fs;
mod memory;

pub use fs::FsEnvironment;
pub use memory::{MemoryContext, MemoryEnvironment};

/// Shared-store write observed from a sibling context.
#[derive(Debug, Clone)]
pub struct StoreWrite {
    pub key: String,
    pub value: String,
}

/// Environment failures (shared-store I/O and encoding).
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("shared store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("shared store encoding: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("shared store watcher: {0}")]
    Watch(#[from] notify::Error),
}

/// Capabilities one context gets from its platform.
///
/// Store writes fan out to every *other* context sharing the store; the
/// writer is never notified of its own write. Same-context delivery is
/// the relay's job.
#[async_trait]
pub trait Environment: Send + Sync + 'static {
    /// Current connectivity state.
    fn is_online(&self) -> bool;

    /// Watch connectivity transitions.
    fn connectivity(&self) -> watch::Receiver<bool>;

    /// Write a shared-store entry visible to sibling contexts.
    async fn write_signal(&self, key: &str, value: &str) -> Result<(), EnvError>;

    /// Remove a shared-store entry. Removing an absent entry is not an
    /// error; expiry races with sibling writers.
    async fn remove_signal(&self, key: &str) -> Result<(), EnvError>;

    /// Subscribe to store writes made by sibling contexts.
    fn subscribe_store(&self) -> broadcast::Receiver<StoreWrite>;
}
