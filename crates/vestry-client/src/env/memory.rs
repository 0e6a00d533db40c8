//! In-process environment: one shared store, many sibling contexts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use super::{EnvError, Environment, StoreWrite};

const STORE_EVENT_BUFFER: usize = 64;

struct Shared {
    entries: Mutex<HashMap<String, String>>,
    contexts: Mutex<Vec<(u64, broadcast::Sender<StoreWrite>)>>,
    next_id: AtomicU64,
    online_tx: watch::Sender<bool>,
}

/// Environment whose sibling contexts live in the same process.
///
/// Matches the deployed semantics: a write lands in the store for
/// everyone, but only sibling contexts are notified of it.
#[derive(Clone)]
pub struct MemoryEnvironment {
    shared: Arc<Shared>,
}

impl MemoryEnvironment {
    pub fn new() -> Self {
        let (online_tx, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                contexts: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                online_tx,
            }),
        }
    }

    /// Open a new sibling context on this store.
    pub fn context(&self) -> MemoryContext {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (store_tx, _) = broadcast::channel(STORE_EVENT_BUFFER);
        self.shared
            .contexts
            .lock()
            .unwrap()
            .push((id, store_tx.clone()));
        MemoryContext {
            id,
            shared: Arc::clone(&self.shared),
            store_tx,
        }
    }

    /// Flip connectivity for every context.
    pub fn set_online(&self, online: bool) {
        self.shared.online_tx.send_replace(online);
    }

    /// Look up a stored entry.
    pub fn get(&self, key: &str) -> Option<String> {
        self.shared.entries.lock().unwrap().get(key).cloned()
    }

    /// Number of entries currently in the store.
    pub fn len(&self) -> usize {
        self.shared.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

/// One sibling context's handle onto a [`MemoryEnvironment`].
pub struct MemoryContext {
    id: u64,
    shared: Arc<Shared>,
    store_tx: broadcast::Sender<StoreWrite>,
}

#[async_trait]
impl Environment for MemoryContext {
    fn is_online(&self) -> bool {
        *self.shared.online_tx.borrow()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.shared.online_tx.subscribe()
    }

    async fn write_signal(&self, key: &str, value: &str) -> Result<(), EnvError> {
        self.shared
            .entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());

        let write = StoreWrite {
            key: key.to_string(),
            value: value.to_string(),
        };
        // Notify every sibling, never the writer
        for (id, tx) in self.shared.contexts.lock().unwrap().iter() {
            if *id != self.id {
                let _ = tx.send(write.clone());
            }
        }
        Ok(())
    }

    async fn remove_signal(&self, key: &str) -> Result<(), EnvError> {
        self.shared.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn subscribe_store(&self) -> broadcast::Receiver<StoreWrite> {
        self.store_tx.subscribe()
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        self.shared
            .contexts
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_notifies_siblings_only() {
        let env = MemoryEnvironment::new();
        let writer = env.context();
        let sibling = env.context();

        let mut writer_rx = writer.subscribe_store();
        let mut sibling_rx = sibling.subscribe_store();

        writer.write_signal("admin-update-sermon-1", "{}").await.unwrap();

        let write = sibling_rx.try_recv().unwrap();
        assert_eq!(write.key, "admin-update-sermon-1");
        assert!(writer_rx.try_recv().is_err());
        assert_eq!(env.get("admin-update-sermon-1").unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_remove_clears_entry() {
        let env = MemoryEnvironment::new();
        let context = env.context();

        context.write_signal("admin-update-gallery-2", "{}").await.unwrap();
        context.remove_signal("admin-update-gallery-2").await.unwrap();

        assert!(env.is_empty());
        // Removing again is fine
        context.remove_signal("admin-update-gallery-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_connectivity_watch() {
        let env = MemoryEnvironment::new();
        let context = env.context();
        let mut connectivity = context.connectivity();

        assert!(context.is_online());

        env.set_online(false);
        connectivity.changed().await.unwrap();
        assert!(!*connectivity.borrow());
        assert!(!context.is_online());
    }

    #[tokio::test]
    async fn test_dropped_context_is_deregistered() {
        let env = MemoryEnvironment::new();
        let writer = env.context();
        let sibling = env.context();
        drop(sibling);

        // No sibling left to notify; the write itself still lands
        writer.write_signal("admin-update-sermon-3", "{}").await.unwrap();
        assert_eq!(env.len(), 1);
    }
}
