//! Client side of the push channel: a reconnecting event-stream consumer.
//!
//! The push channel is an optimization, not the guarantee; consumers keep
//! their polling subscription as the source of truth and use this to cut
//! latency while it happens to be up.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

use vestry_protocol::UpdateEvent;

/// Maximum number of reconnection attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 50;

/// Base delay for exponential backoff (milliseconds).
const BASE_BACKOFF_MS: u64 = 500;

/// Maximum backoff delay (milliseconds).
const MAX_BACKOFF_MS: u64 = 30_000;

/// Size of the re-publish buffer.
const EVENT_BUFFER_SIZE: usize = 256;

/// Connection state of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Long-lived consumer of the server's `/events` stream.
///
/// Decoded events are re-published on a broadcast channel. Heartbeat
/// comment frames are consumed by the event-source parser and never
/// surface here. A dropped connection reconnects with capped exponential
/// backoff; events published during the gap are simply missed.
pub struct UpdateListener {
    events_tx: broadcast::Sender<UpdateEvent>,
    state: Arc<RwLock<ConnectionState>>,
    driver: JoinHandle<()>,
}

impl UpdateListener {
    /// Connect to the events endpoint and keep the stream alive.
    pub fn connect(url: impl Into<String>) -> Self {
        let url = url.into();
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let driver = tokio::spawn(run(url, events_tx.clone(), Arc::clone(&state)));
        Self {
            events_tx,
            state,
            driver,
        }
    }

    /// Subscribe to decoded update events.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events_tx.subscribe()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

impl Drop for UpdateListener {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn run(
    url: String,
    events_tx: broadcast::Sender<UpdateEvent>,
    state: Arc<RwLock<ConnectionState>>,
) {
    let mut attempts: u32 = 0;

    while attempts < MAX_RECONNECT_ATTEMPTS {
        *state.write().await = ConnectionState::Connecting;
        let mut source = EventSource::get(&url);

        while let Some(item) = source.next().await {
            match item {
                Ok(Event::Open) => {
                    info!("Event stream opened");
                    *state.write().await = ConnectionState::Connected;
                }
                Ok(Event::Message(message)) => {
                    match serde_json::from_str::<UpdateEvent>(&message.data) {
                        Ok(event) => {
                            if event.is_connected() {
                                // Server handshake: the channel is live,
                                // start the backoff ladder over
                                attempts = 0;
                                debug!("Event stream handshake received");
                            }
                            let _ = events_tx.send(event);
                        }
                        Err(err) => warn!("Undecodable stream frame: {err}"),
                    }
                }
                Err(err) => {
                    warn!("Event stream error: {err}");
                    source.close();
                    break;
                }
            }
        }

        *state.write().await = ConnectionState::Disconnected;
        attempts += 1;
        let backoff = backoff_delay(attempts);
        debug!("Reconnecting event stream in {backoff:?} (attempt {attempts})");
        tokio::time::sleep(backoff).await;
    }

    warn!("Event stream gave up after {MAX_RECONNECT_ATTEMPTS} attempts");
}

fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let delay = BASE_BACKOFF_MS.saturating_mul(1 << shift);
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(10), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_millis(MAX_BACKOFF_MS));
    }
}
