//! Filesystem-backed environment for cross-process sibling contexts.
//!
//! Signals are JSON files in a shared directory; a `notify` watcher turns
//! sibling writes into store events. Own writes are filtered out by key
//! bookkeeping, matching the writer-is-not-notified semantics of the
//! in-process environment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::warn;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, watch};

use super::{EnvError, Environment, StoreWrite};

const STORE_EVENT_BUFFER: usize = 64;

/// Environment whose sibling contexts are separate processes sharing a
/// signal directory.
pub struct FsEnvironment {
    dir: PathBuf,
    own_keys: Arc<Mutex<HashSet<String>>>,
    store_tx: broadcast::Sender<StoreWrite>,
    online_tx: watch::Sender<bool>,
    _watcher: RecommendedWatcher,
}

impl FsEnvironment {
    /// Watch `dir` for sibling signals; the directory is created if
    /// absent.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, EnvError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let (store_tx, _) = broadcast::channel(STORE_EVENT_BUFFER);
        let (online_tx, _) = watch::channel(true);
        let own_keys: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let tx = store_tx.clone();
        let own = Arc::clone(&own_keys);
        let root = dir.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    warn!("Signal watcher error: {err}");
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in &event.paths {
                if let Some(write) = read_store_write(&root, path, &own) {
                    let _ = tx.send(write);
                }
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            dir,
            own_keys,
            store_tx,
            online_tx,
            _watcher: watcher,
        })
    }

    /// Flip the connectivity flag of this context.
    ///
    /// Deployments drive this from their network monitoring; tests drive
    /// it directly.
    pub fn set_online(&self, online: bool) {
        self.online_tx.send_replace(online);
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn read_store_write(
    root: &Path,
    path: &Path,
    own: &Mutex<HashSet<String>>,
) -> Option<StoreWrite> {
    if path.parent() != Some(root) {
        return None;
    }
    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        return None;
    }
    let key = path.file_stem()?.to_str()?.to_string();
    if own.lock().unwrap().contains(&key) {
        return None;
    }
    // The file may already be gone if the writer expired it
    let value = std::fs::read_to_string(path).ok()?;
    Some(StoreWrite { key, value })
}

#[async_trait]
impl Environment for FsEnvironment {
    fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    async fn write_signal(&self, key: &str, value: &str) -> Result<(), EnvError> {
        // Marked before the write so the watcher filters the event no
        // matter how quickly it fires
        self.own_keys.lock().unwrap().insert(key.to_string());
        tokio::fs::write(self.path_for(key), value).await?;
        Ok(())
    }

    async fn remove_signal(&self, key: &str) -> Result<(), EnvError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.own_keys.lock().unwrap().remove(key);
        Ok(())
    }

    fn subscribe_store(&self) -> broadcast::Receiver<StoreWrite> {
        self.store_tx.subscribe()
    }
}
