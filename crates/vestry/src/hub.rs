//! Push hub managing open client channels and broadcasting events.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use vestry_protocol::UpdateEvent;

/// Default per-channel send buffer.
pub const DEFAULT_CHANNEL_BUFFER: usize = 64;

/// Default interval between heartbeat frames on idle streams.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Hub tuning knobs, populated from settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-channel send buffer; a channel this far behind misses events.
    pub channel_buffer: usize,
    /// Interval between heartbeat comment frames.
    pub heartbeat: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
        }
    }
}

/// Registry of open output channels with fire-and-forget fan-out.
///
/// One hub instance is shared by all publishers and stream handlers; it is
/// created at process start and owned by the application state, so tests
/// construct isolated instances freely. `publish` may be called from many
/// handlers concurrently. A channel that fails a write is evicted and the
/// failure is swallowed: publishers never observe subscriber-side errors.
pub struct PushHub {
    channels: Arc<DashMap<Uuid, mpsc::Sender<UpdateEvent>>>,
    config: HubConfig,
}

impl PushHub {
    /// Create a hub with the given configuration.
    pub fn new(config: HubConfig) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Interval between heartbeat frames for streams served off this hub.
    pub fn heartbeat(&self) -> Duration {
        self.config.heartbeat
    }

    /// Register a new output channel.
    ///
    /// The returned stream yields the `connected` handshake first and
    /// deregisters the channel when dropped, which covers every exit path
    /// of the response that owns it.
    pub fn open(&self) -> OpenChannel {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.channel_buffer.max(1));

        // Queued before the channel is visible to publishers, so it is
        // always the first frame.
        let _ = tx.try_send(UpdateEvent::connected());

        self.channels.insert(id, tx);
        info!("Opened channel {id} ({} open)", self.channels.len());

        OpenChannel {
            id,
            rx,
            _guard: ChannelGuard {
                id,
                channels: Arc::clone(&self.channels),
            },
        }
    }

    /// Fan an event out to every channel registered at call time.
    ///
    /// Returns how many channels accepted the event; callers are free to
    /// ignore it. A channel whose transport is gone is evicted. A full
    /// buffer drops the event for that channel only: delivery is
    /// at-most-once and publishers are never backpressured.
    pub fn publish(&self, kind: &str, data: Value) -> usize {
        let event = UpdateEvent::new(kind, data);
        let mut delivered = 0;
        let mut dead = Vec::new();

        for entry in self.channels.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel {} is backed up, dropping {kind} event", entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*entry.key()),
            }
        }

        // Removal happens after iteration; a DashMap shard must not be
        // written while an iterator holds it.
        for id in dead {
            if self.channels.remove(&id).is_some() {
                debug!("Evicted closed channel {id}");
            }
        }

        debug!("Published {kind} event to {delivered} channels");
        delivered
    }

    /// Deregister a channel explicitly (client-initiated cancellation).
    pub fn close(&self, id: Uuid) {
        if self.channels.remove(&id).is_some() {
            info!("Closed channel {id} ({} open)", self.channels.len());
        }
    }

    /// Number of currently open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

/// One client's open output stream and its registry entry.
pub struct OpenChannel {
    id: Uuid,
    rx: mpsc::Receiver<UpdateEvent>,
    _guard: ChannelGuard,
}

impl OpenChannel {
    /// Registry handle of this channel.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next event; `None` once the channel is deregistered
    /// and drained.
    pub async fn recv(&mut self) -> Option<UpdateEvent> {
        self.rx.recv().await
    }
}

impl Stream for OpenChannel {
    type Item = UpdateEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct ChannelGuard {
    id: Uuid,
    channels: Arc<DashMap<Uuid, mpsc::Sender<UpdateEvent>>>,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if self.channels.remove(&self.id).is_some() {
            debug!("Channel {} disconnected", self.id);
        }
    }
}
