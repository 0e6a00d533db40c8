//! Resilient polling subscription.
//!
//! A subscription owns one driver task that serializes every fetch: the
//! startup fetch, interval ticks, manual refreshes, relay-triggered
//! refetches, and the reconnect fetch all run through the same path, so
//! no two fetches for one subscription ever overlap. Polling is the
//! source of truth for freshness; push channels and relay signals only
//! shorten the wait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use vestry_protocol::Signal;

use crate::env::Environment;
use crate::relay::SignalObserver;

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(30_000);

/// Typed fetch failure carried in the snapshot next to stale data.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FetchError {
    message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Where the subscription currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// No fetch has run yet.
    Idle,
    /// A fetch is in flight.
    Loading,
    /// The last fetch succeeded.
    Ready,
    /// The last fetch failed; `data` still holds the previous good value.
    Error,
    /// Offline; scheduled fetches are halted until connectivity returns.
    Paused,
}

/// Point-in-time view of a subscription.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot<T> {
    pub status: PollStatus,
    pub data: Option<T>,
    pub error: Option<FetchError>,
    /// Epoch milliseconds of the last successful fetch.
    pub last_updated: Option<i64>,
}

impl<T> ResourceSnapshot<T> {
    fn idle() -> Self {
        Self {
            status: PollStatus::Idle,
            data: None,
            error: None,
            last_updated: None,
        }
    }

    /// Whether the view shows data that outlived a failed refresh.
    pub fn is_stale(&self) -> bool {
        self.status == PollStatus::Error && self.data.is_some()
    }
}

/// Subscription tuning.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Time between scheduled fetches.
    pub interval: Duration,
    /// A disabled subscription never fetches on its own; manual
    /// [`PolledResource::refresh`] still works.
    pub enabled: bool,
    /// Relay kinds that trigger an out-of-band refetch; empty means any.
    pub signal_kinds: Vec<String>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            enabled: true,
            signal_kinds: Vec::new(),
        }
    }
}

/// Handle to a polling subscription.
///
/// Dropping the handle aborts the driver; a fetch that was in flight at
/// that moment is cancelled with it and its result never applied.
pub struct PolledResource<T> {
    snapshot_rx: watch::Receiver<ResourceSnapshot<T>>,
    refresh_tx: mpsc::Sender<()>,
    driver: JoinHandle<()>,
}

impl<T: Clone + Send + Sync + 'static> PolledResource<T> {
    /// Spawn the subscription driver.
    ///
    /// `observer` carries relay signals into the fetch loop; pass `None`
    /// for a plain timer-driven subscription.
    pub fn spawn<F, Fut>(
        env: Arc<dyn Environment>,
        observer: Option<SignalObserver>,
        fetch: F,
        config: PollConfig,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let (snapshot_tx, snapshot_rx) = watch::channel(ResourceSnapshot::idle());
        let (refresh_tx, refresh_rx) = mpsc::channel(8);
        let driver = tokio::spawn(drive(env, observer, fetch, config, snapshot_tx, refresh_rx));
        Self {
            snapshot_rx,
            refresh_tx,
            driver,
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ResourceSnapshot<T> {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot<T>> {
        self.snapshot_rx.clone()
    }

    /// Request an out-of-band refetch through the serialized fetch path.
    pub async fn refresh(&self) {
        let _ = self.refresh_tx.send(()).await;
    }
}

impl<T> Drop for PolledResource<T> {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive<T, F, Fut>(
    env: Arc<dyn Environment>,
    mut observer: Option<SignalObserver>,
    mut fetch: F,
    config: PollConfig,
    snapshot_tx: watch::Sender<ResourceSnapshot<T>>,
    mut refresh_rx: mpsc::Receiver<()>,
) where
    T: Clone + Send + Sync + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    let mut connectivity = env.connectivity();
    let mut connectivity_open = true;

    let mut ticker = time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Swallow the interval's immediate first tick; the startup fetch
    // below takes its place.
    ticker.reset();

    if config.enabled && *connectivity.borrow_and_update() {
        run_fetch(&mut fetch, &snapshot_tx).await;
        ticker.reset();
    }

    loop {
        let online = *connectivity.borrow();
        tokio::select! {
            _ = ticker.tick(), if config.enabled && online => {
                run_fetch(&mut fetch, &snapshot_tx).await;
                // The next tick is only scheduled once this fetch settled
                ticker.reset();
            }
            request = refresh_rx.recv() => {
                match request {
                    Some(()) => {
                        run_fetch(&mut fetch, &snapshot_tx).await;
                        ticker.reset();
                    }
                    // All handles gone; the abort in Drop normally wins
                    None => break,
                }
            }
            signal = next_signal(&mut observer) => {
                match signal {
                    Some(signal) if signal_matches(&config, &signal) => {
                        debug!("Refetching after relay signal {}", signal.kind);
                        run_fetch(&mut fetch, &snapshot_tx).await;
                        ticker.reset();
                    }
                    Some(signal) => {
                        debug!("Ignoring relay signal {}", signal.kind);
                    }
                    None => observer = None,
                }
            }
            changed = connectivity.changed(), if connectivity_open => {
                match changed {
                    Ok(()) => {
                        if *connectivity.borrow_and_update() {
                            if config.enabled {
                                // Back online: one immediate fetch, then
                                // the interval resumes
                                run_fetch(&mut fetch, &snapshot_tx).await;
                                ticker.reset();
                            }
                        } else {
                            snapshot_tx.send_modify(|snapshot| {
                                snapshot.status = PollStatus::Paused;
                            });
                        }
                    }
                    Err(_) => connectivity_open = false,
                }
            }
        }
    }
}

async fn run_fetch<T, F, Fut>(fetch: &mut F, snapshot_tx: &watch::Sender<ResourceSnapshot<T>>)
where
    T: Clone + Send + Sync + 'static,
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, FetchError>> + Send,
{
    snapshot_tx.send_modify(|snapshot| snapshot.status = PollStatus::Loading);

    match fetch().await {
        Ok(data) => snapshot_tx.send_modify(|snapshot| {
            snapshot.status = PollStatus::Ready;
            snapshot.data = Some(data);
            snapshot.error = None;
            snapshot.last_updated = Some(Utc::now().timestamp_millis());
        }),
        Err(err) => {
            warn!("Fetch failed: {err}");
            snapshot_tx.send_modify(|snapshot| {
                // Stale-while-revalidate: previous good data survives
                snapshot.status = PollStatus::Error;
                snapshot.error = Some(err);
            });
        }
    }
}

async fn next_signal(observer: &mut Option<SignalObserver>) -> Option<Signal> {
    match observer {
        Some(observer) => observer.recv().await,
        None => std::future::pending().await,
    }
}

fn signal_matches(config: &PollConfig, signal: &Signal) -> bool {
    config.signal_kinds.is_empty() || config.signal_kinds.iter().any(|kind| *kind == signal.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use serde_json::json;

    use crate::env::MemoryEnvironment;
    use crate::relay::Relay;

    fn counting_fetch(
        counter: Arc<AtomicUsize>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<usize, FetchError>> + Send>>
    {
        move || {
            let counter = counter.clone();
            Box::pin(async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) })
        }
    }

    async fn wait_for<T: Clone + Send + Sync>(
        rx: &mut watch::Receiver<ResourceSnapshot<T>>,
        predicate: impl FnMut(&ResourceSnapshot<T>) -> bool,
    ) -> ResourceSnapshot<T> {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot")
            .expect("subscription driver gone")
            .clone()
    }

    #[tokio::test]
    async fn test_fetch_fires_immediately_on_spawn() {
        let env = MemoryEnvironment::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let resource = PolledResource::spawn(
            Arc::new(env.context()),
            None,
            counting_fetch(counter.clone()),
            PollConfig {
                interval: Duration::from_secs(600),
                ..PollConfig::default()
            },
        );

        let mut rx = resource.subscribe();
        let snapshot = wait_for(&mut rx, |s| s.status == PollStatus::Ready).await;

        assert_eq!(snapshot.data, Some(1));
        assert!(snapshot.last_updated.is_some());
        assert!(snapshot.error.is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheduled_ticks_never_overlap() {
        let env = MemoryEnvironment::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicUsize::new(0));

        let fetch = {
            let in_flight = in_flight.clone();
            let overlapped = overlapped.clone();
            let completed = completed.clone();
            move || {
                let in_flight = in_flight.clone();
                let overlapped = overlapped.clone();
                let completed = completed.clone();
                Box::pin(async move {
                    if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    // Slower than the interval on purpose
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(completed.fetch_add(1, Ordering::SeqCst) + 1)
                })
                    as std::pin::Pin<
                        Box<dyn Future<Output = Result<usize, FetchError>> + Send>,
                    >
            }
        };

        let resource = PolledResource::spawn(
            Arc::new(env.context()),
            None,
            fetch,
            PollConfig {
                interval: Duration::from_millis(30),
                ..PollConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(resource);

        assert!(!overlapped.load(Ordering::SeqCst), "fetches overlapped");
        assert!(completed.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_disabled_subscription_only_fetches_on_refresh() {
        let env = MemoryEnvironment::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let resource = PolledResource::spawn(
            Arc::new(env.context()),
            None,
            counting_fetch(counter.clone()),
            PollConfig {
                interval: Duration::from_millis(30),
                enabled: false,
                ..PollConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(resource.snapshot().status, PollStatus::Idle);

        resource.refresh().await;
        let mut rx = resource.subscribe();
        let snapshot = wait_for(&mut rx, |s| s.status == PollStatus::Ready).await;
        assert_eq!(snapshot.data, Some(1));
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_stale_data() {
        let env = MemoryEnvironment::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = {
            let calls = calls.clone();
            move || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    // Second fetch fails, the rest succeed
                    if call == 1 {
                        Err(FetchError::new("backend unreachable"))
                    } else {
                        Ok(format!("revision-{call}"))
                    }
                })
                    as std::pin::Pin<
                        Box<dyn Future<Output = Result<String, FetchError>> + Send>,
                    >
            }
        };

        let resource = PolledResource::spawn(
            Arc::new(env.context()),
            None,
            fetch,
            PollConfig {
                interval: Duration::from_secs(600),
                ..PollConfig::default()
            },
        );

        let mut rx = resource.subscribe();
        wait_for(&mut rx, |s| s.status == PollStatus::Ready).await;

        resource.refresh().await;
        let snapshot = wait_for(&mut rx, |s| s.status == PollStatus::Error).await;
        assert_eq!(snapshot.data.as_deref(), Some("revision-0"));
        assert!(snapshot.is_stale());
        assert_eq!(snapshot.error.unwrap().message(), "backend unreachable");

        resource.refresh().await;
        let snapshot = wait_for(&mut rx, |s| s.status == PollStatus::Ready).await;
        assert_eq!(snapshot.data.as_deref(), Some("revision-2"));
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_offline_pauses_and_reconnect_fetches_once() {
        let env = MemoryEnvironment::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let resource = PolledResource::spawn(
            Arc::new(env.context()),
            None,
            counting_fetch(counter.clone()),
            PollConfig {
                interval: Duration::from_secs(600),
                ..PollConfig::default()
            },
        );

        let mut rx = resource.subscribe();
        wait_for(&mut rx, |s| s.status == PollStatus::Ready).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        env.set_online(false);
        wait_for(&mut rx, |s| s.status == PollStatus::Paused).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1, "fetched while offline");

        env.set_online(true);
        wait_for(&mut rx, |s| s.status == PollStatus::Ready).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        // Exactly one reconnect fetch; the long interval owns the rest
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_relay_signal_triggers_refetch() {
        let env = MemoryEnvironment::new();
        let admin_relay = Relay::new(Arc::new(env.context()));

        let viewer = Arc::new(env.context());
        let viewer_relay = Relay::new(viewer.clone() as Arc<dyn Environment>);
        let counter = Arc::new(AtomicUsize::new(0));
        let resource = PolledResource::spawn(
            viewer,
            Some(viewer_relay.observe()),
            counting_fetch(counter.clone()),
            PollConfig {
                interval: Duration::from_secs(600),
                ..PollConfig::default()
            },
        );

        let mut rx = resource.subscribe();
        wait_for(&mut rx, |s| s.status == PollStatus::Ready).await;

        admin_relay
            .signal("gallery", json!({"id": "7"}))
            .await
            .unwrap();

        wait_for(&mut rx, |s| s.data == Some(2)).await;

        // One distinct key, one refetch
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_signal_kind_filter() {
        let env = MemoryEnvironment::new();
        let admin_relay = Relay::new(Arc::new(env.context()));

        let viewer = Arc::new(env.context());
        let viewer_relay = Relay::new(viewer.clone() as Arc<dyn Environment>);
        let counter = Arc::new(AtomicUsize::new(0));
        let resource = PolledResource::spawn(
            viewer,
            Some(viewer_relay.observe()),
            counting_fetch(counter.clone()),
            PollConfig {
                interval: Duration::from_secs(600),
                signal_kinds: vec!["sermon".to_string()],
                ..PollConfig::default()
            },
        );

        let mut rx = resource.subscribe();
        wait_for(&mut rx, |s| s.status == PollStatus::Ready).await;

        admin_relay
            .signal("gallery", json!({"id": "7"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        admin_relay.signal("sermon", json!({"id": "1"})).await.unwrap();
        wait_for(&mut rx, |s| s.data == Some(2)).await;
    }

    #[tokio::test]
    async fn test_dropped_subscription_discards_inflight_result() {
        let env = MemoryEnvironment::new();
        let applied = Arc::new(AtomicBool::new(false));

        let fetch = {
            let applied = applied.clone();
            move || {
                let applied = applied.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    applied.store(true, Ordering::SeqCst);
                    Ok(1usize)
                })
                    as std::pin::Pin<
                        Box<dyn Future<Output = Result<usize, FetchError>> + Send>,
                    >
            }
        };

        let resource = PolledResource::spawn(
            Arc::new(env.context()),
            None,
            fetch,
            PollConfig::default(),
        );

        let mut rx = resource.subscribe();
        wait_for(&mut rx, |s| s.status == PollStatus::Loading).await;

        drop(resource);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The fetch future died with the driver; its result was never
        // applied
        assert!(!applied.load(Ordering::SeqCst));
        assert_eq!(rx.borrow().status, PollStatus::Loading);
    }
}
