//! Cross-context relay: advisory change notifications between sibling
//! contexts that hold no open push channel.

use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::broadcast;

use vestry_protocol::{SIGNAL_TTL, Signal, parse_signal_key};

use crate::env::{EnvError, Environment, StoreWrite};

const LOCAL_EVENT_BUFFER: usize = 64;

/// Fans mutation signals out to sibling contexts through the shared
/// store, and to same-context observers directly.
///
/// Signals are fire-and-forget: no acknowledgment, no redelivery.
/// Receivers treat them strictly as a trigger to re-fetch authoritative
/// state.
pub struct Relay {
    env: Arc<dyn Environment>,
    local_tx: broadcast::Sender<Signal>,
}

impl Relay {
    pub fn new(env: Arc<dyn Environment>) -> Self {
        let (local_tx, _) = broadcast::channel(LOCAL_EVENT_BUFFER);
        Self { env, local_tx }
    }

    /// Announce a mutation.
    ///
    /// Writes a uniquely keyed store entry for sibling contexts and
    /// schedules its removal after [`SIGNAL_TTL`] to bound storage
    /// growth. The store write does not notify this context, so local
    /// observers get the signal through the in-process path immediately.
    pub async fn signal(&self, kind: &str, payload: Value) -> Result<(), EnvError> {
        let signal = Signal::new(kind, payload);
        let key = signal.key();
        let value = serde_json::to_string(&signal)?;

        self.env.write_signal(&key, &value).await?;
        debug!("Wrote relay signal {key}");

        let env = Arc::clone(&self.env);
        tokio::spawn(async move {
            tokio::time::sleep(SIGNAL_TTL).await;
            if let Err(err) = env.remove_signal(&key).await {
                warn!("Failed to expire relay signal {key}: {err}");
            }
        });

        let _ = self.local_tx.send(signal);
        Ok(())
    }

    /// Observe signals from this context and its siblings.
    ///
    /// Dropping the observer deregisters both subscriptions.
    pub fn observe(&self) -> SignalObserver {
        SignalObserver {
            local: self.local_tx.subscribe(),
            store: self.env.subscribe_store(),
            local_closed: false,
            store_closed: false,
        }
    }
}

/// Stream of relay signals for one observer.
///
/// Store writes whose keys do not follow the `admin-update-` convention
/// are ignored; each matching write is surfaced exactly once.
pub struct SignalObserver {
    local: broadcast::Receiver<Signal>,
    store: broadcast::Receiver<StoreWrite>,
    local_closed: bool,
    store_closed: bool,
}

impl SignalObserver {
    /// Next signal, from either the in-process path or a sibling's store
    /// write. `None` once the relay and every sibling context are gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        use broadcast::error::RecvError;

        loop {
            if self.local_closed && self.store_closed {
                return None;
            }
            tokio::select! {
                local = self.local.recv(), if !self.local_closed => match local {
                    Ok(signal) => return Some(signal),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Signal observer lagged, skipped {skipped} local signals");
                    }
                    Err(RecvError::Closed) => self.local_closed = true,
                },
                write = self.store.recv(), if !self.store_closed => match write {
                    Ok(write) => {
                        if let Some(signal) = decode_store_write(&write) {
                            return Some(signal);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Signal observer lagged, skipped {skipped} store writes");
                    }
                    Err(RecvError::Closed) => self.store_closed = true,
                },
            }
        }
    }
}

fn decode_store_write(write: &StoreWrite) -> Option<Signal> {
    parse_signal_key(&write.key)?;
    match serde_json::from_str(&write.value) {
        Ok(signal) => Some(signal),
        Err(err) => {
            warn!("Undecodable relay signal under {}: {err}", write.key);
            None
        }
    }
}
