//! Location ingestion: merges the poll and push transports into one stream
//! of snapshot statuses, degrading to the persistent cache when the network
//! is gone or the fetch path fails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::PersistentCache;
use crate::models::{parse_snapshot, VehicleSnapshot};
use crate::providers::fetch::{FetchError, RetryingFetcher, Transport};
use crate::providers::realtime::RealtimeChannel;
use crate::services::network::NetworkMonitor;
use crate::sync::SyncSink;

/// User-facing status strings. The three degraded states must stay
/// distinguishable: offline-with-cache, refresh-failed-with-cache, and
/// offline-with-nothing.
pub const MSG_OFFLINE_SHOWING_SAVED: &str = "You are offline. Showing saved data.";
pub const MSG_REFRESH_FAILED_SHOWING_SAVED: &str =
    "Could not load fresh data. Showing saved data.";
pub const MSG_OFFLINE_NO_CACHE: &str = "No internet connection and no saved data.";

/// Where a fetch cycle gets its body from. The production source is
/// [`RestSource`]; tests script their own.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_snapshot(&self, cancel: &CancellationToken) -> Result<String, FetchError>;
}

/// Polls the REST endpoint through the retrying fetcher.
pub struct RestSource<T: Transport> {
    fetcher: RetryingFetcher<T>,
    url: String,
}

impl<T: Transport> RestSource<T> {
    pub fn new(url: String, fetcher: RetryingFetcher<T>) -> Self {
        Self { fetcher, url }
    }
}

#[async_trait]
impl<T: Transport + 'static> SnapshotSource for RestSource<T> {
    async fn fetch_snapshot(&self, cancel: &CancellationToken) -> Result<String, FetchError> {
        self.fetcher.fetch(&self.url, cancel).await.map(|r| r.body)
    }
}

/// What the ingestion loop needs from the push transport: whether it is
/// currently delivering, a stream of pushed snapshots, and teardown. The
/// production feed is [`RealtimeChannel`]; tests script their own.
pub trait RealtimeFeed: Send + Sync + 'static {
    fn is_open(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<VehicleSnapshot>;
    fn close(&self);
}

impl RealtimeFeed for RealtimeChannel {
    fn is_open(&self) -> bool {
        RealtimeChannel::is_open(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<VehicleSnapshot> {
        RealtimeChannel::subscribe(self)
    }

    fn close(&self) {
        RealtimeChannel::close(self)
    }
}

/// Coarse ingestion state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPhase {
    Loading,
    Ready { from_cache: bool },
    Error { recoverable: bool },
}

/// Everything a consumer needs to render the current situation.
#[derive(Debug, Clone)]
pub struct IngestStatus {
    pub data: Option<VehicleSnapshot>,
    pub loading: bool,
    pub error: Option<String>,
    pub is_from_cache: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub is_offline: bool,
    pub phase: IngestPhase,
}

impl Default for IngestStatus {
    fn default() -> Self {
        Self {
            data: None,
            loading: true,
            error: None,
            is_from_cache: false,
            last_update: None,
            is_offline: false,
            phase: IngestPhase::Loading,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub poll_interval: Duration,
    pub enable_realtime: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            enable_realtime: true,
        }
    }
}

enum FallbackReason {
    Offline,
    Failure(String),
}

/// Coordinates poll cadence, retrying fetches, cache fallback and realtime
/// pushes into a single ordered stream of [`IngestStatus`] updates.
///
/// At most one fetch cycle is live at a time: starting a cycle cancels the
/// previous token, and every cycle carries a sequence number so a slow
/// response that outlives its cancellation is discarded instead of
/// clobbering fresher data.
pub struct LocationIngestor<S: SnapshotSource, R: RealtimeFeed = RealtimeChannel> {
    source: S,
    cache: PersistentCache,
    sink: Option<SyncSink>,
    network: NetworkMonitor,
    realtime: Option<R>,
    options: IngestOptions,
    state: RwLock<IngestStatus>,
    updates_tx: broadcast::Sender<IngestStatus>,
    cycle: AtomicU64,
    current_cancel: Mutex<CancellationToken>,
    shutdown: CancellationToken,
}

impl<S: SnapshotSource, R: RealtimeFeed> LocationIngestor<S, R> {
    pub fn new(
        source: S,
        cache: PersistentCache,
        sink: Option<SyncSink>,
        network: NetworkMonitor,
        realtime: Option<R>,
        options: IngestOptions,
    ) -> Self {
        // Capacity 16 - consumers always re-read the latest status anyway.
        let (updates_tx, _) = broadcast::channel(16);
        Self {
            source,
            cache,
            sink,
            network,
            realtime,
            options,
            state: RwLock::new(IngestStatus::default()),
            updates_tx,
            cycle: AtomicU64::new(0),
            current_cancel: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Current status snapshot.
    pub async fn status(&self) -> IngestStatus {
        self.state.read().await.clone()
    }

    /// Subscribe to status updates. Updates arrive in production order no
    /// matter which transport produced them.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestStatus> {
        self.updates_tx.subscribe()
    }

    /// Manually trigger a fetch cycle, cancelling any in-flight one.
    pub async fn refresh(&self) {
        self.run_cycle().await;
    }

    /// Cancel the in-flight fetch, stop the poll loop and close the realtime
    /// channel. Safe to call any number of times.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.current_cancel
            .lock()
            .expect("cancel token lock poisoned")
            .cancel();
        if let Some(channel) = &self.realtime {
            channel.close();
        }
    }

    /// Run the ingestion loops until shutdown: one immediate cycle, then
    /// fixed-interval polling (suppressed while the realtime channel is
    /// open) plus forwarding of unsolicited realtime snapshots.
    pub async fn start(self: Arc<Self>) {
        info!(
            poll_interval_secs = self.options.poll_interval.as_secs(),
            realtime = self.realtime.is_some() && self.options.enable_realtime,
            "Starting location ingestion"
        );

        self.run_cycle().await;

        if self.options.enable_realtime {
            if let Some(channel) = &self.realtime {
                let mut updates = channel.subscribe();
                let push_self = self.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = push_self.shutdown.cancelled() => break,
                            result = updates.recv() => match result {
                                Ok(snapshot) => push_self.apply_snapshot(snapshot, true).await,
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    debug!(skipped, "Realtime updates lagged");
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    }
                });
            }
        }

        let mut interval = tokio::time::interval(self.options.poll_interval);
        // Skip the first tick which fires immediately (initial cycle above).
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if self.realtime_is_open() {
                        debug!("Realtime channel open, skipping poll tick");
                        continue;
                    }
                    self.run_cycle().await;
                }
            }
        }
    }

    fn realtime_is_open(&self) -> bool {
        self.options.enable_realtime
            && self
                .realtime
                .as_ref()
                .map(|channel| channel.is_open())
                .unwrap_or(false)
    }

    fn is_latest(&self, seq: u64) -> bool {
        self.cycle.load(Ordering::SeqCst) == seq
    }

    async fn run_cycle(&self) {
        let seq = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = {
            let mut guard = self
                .current_cancel
                .lock()
                .expect("cancel token lock poisoned");
            guard.cancel();
            *guard = self.shutdown.child_token();
            guard.clone()
        };

        if self.network.is_offline() {
            debug!("Offline, skipping network and serving from cache");
            self.serve_from_cache(FallbackReason::Offline).await;
            return;
        }

        let loading = {
            let mut state = self.state.write().await;
            state.loading = true;
            state.error = None;
            state.is_from_cache = false;
            state.is_offline = false;
            state.phase = IngestPhase::Loading;
            state.clone()
        };
        // Subscribers see the Loading transition too, not just terminal states.
        let _ = self.updates_tx.send(loading);

        let result = self.source.fetch_snapshot(&cancel).await;

        // A newer cycle owns the state now; drop this result even if it is
        // chronologically older than what that cycle will produce.
        if cancel.is_cancelled() || !self.is_latest(seq) {
            return;
        }

        match result {
            Ok(body) => match parse_snapshot(&body) {
                Ok(snapshot) => self.apply_snapshot(snapshot, false).await,
                Err(e) => {
                    warn!(error = %e, "Failed to parse snapshot body");
                    self.serve_from_cache(FallbackReason::Failure(e.to_string()))
                        .await;
                }
            },
            Err(FetchError::Cancelled) => {}
            Err(e) => {
                warn!(error = %e, "Fetch failed after retries");
                self.serve_from_cache(FallbackReason::Failure(e.to_string()))
                    .await;
            }
        }
    }

    /// Success path, shared by fetch and realtime delivery: surface the
    /// snapshot, then persist and forward it without blocking on either.
    async fn apply_snapshot(&self, snapshot: VehicleSnapshot, pushed: bool) {
        let status = {
            let mut state = self.state.write().await;
            state.data = Some(snapshot.clone());
            state.loading = false;
            state.error = None;
            state.is_from_cache = false;
            state.last_update = Some(Utc::now());
            state.is_offline = false;
            state.phase = IngestPhase::Ready { from_cache: false };
            state.clone()
        };
        debug!(vehicles = snapshot.len(), pushed, "Applied fresh snapshot");
        // Send errors just mean no one is listening.
        let _ = self.updates_tx.send(status);

        // Cache and sink writes are fire-and-forget: their failures are
        // logged and never reach the live path.
        let cache = self.cache.clone();
        let cached = snapshot.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.save_snapshot(&cached).await {
                warn!(error = %e, "Failed to write snapshot cache");
            }
        });

        if let Some(sink) = &self.sink {
            let sink = sink.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.sync_snapshot(&snapshot).await {
                    warn!(error = %e, "Background sync failed");
                }
            });
        }
    }

    async fn serve_from_cache(&self, reason: FallbackReason) {
        let offline = matches!(&reason, FallbackReason::Offline);
        let cached = match self.cache.load_snapshot().await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, "Cache read failed");
                None
            }
        };

        let status = {
            let mut state = self.state.write().await;
            state.loading = false;
            state.is_offline = offline;
            match cached {
                Some(cached) => {
                    state.data = Some(cached.data);
                    state.is_from_cache = true;
                    state.last_update = cached.last_update;
                    state.error = Some(
                        match reason {
                            FallbackReason::Offline => MSG_OFFLINE_SHOWING_SAVED,
                            FallbackReason::Failure(_) => MSG_REFRESH_FAILED_SHOWING_SAVED,
                        }
                        .to_string(),
                    );
                    state.phase = IngestPhase::Ready { from_cache: true };
                }
                None => {
                    state.is_from_cache = false;
                    state.error = Some(match reason {
                        FallbackReason::Offline => MSG_OFFLINE_NO_CACHE.to_string(),
                        FallbackReason::Failure(message) => message,
                    });
                    // Recoverable via manual refresh once the network is back.
                    state.phase = IngestPhase::Error { recoverable: true };
                }
            }
            state.clone()
        };
        let _ = self.updates_tx.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VehicleLocation;
    use crate::services::network;
    use sqlx::SqlitePool;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU32};

    /// Scripted source: each call pops a (delay, result) pair; once the
    /// script runs out it serves the last configured fallback body.
    struct MockSource {
        script: Mutex<VecDeque<(Duration, Result<String, FetchError>)>>,
        fallback: Result<String, FetchError>,
        calls: AtomicU32,
    }

    impl MockSource {
        fn always_ok(body: &str) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Ok(body.to_string()),
                calls: AtomicU32::new(0),
            }
        }

        fn always_failing() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Err(FetchError::Network("connection refused".to_string())),
                calls: AtomicU32::new(0),
            }
        }

        fn scripted(script: Vec<(Duration, Result<String, FetchError>)>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: Err(FetchError::Network("script exhausted".to_string())),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn clone_result(result: &Result<String, FetchError>) -> Result<String, FetchError> {
        match result {
            Ok(body) => Ok(body.clone()),
            Err(FetchError::Network(message)) => Err(FetchError::Network(message.clone())),
            Err(FetchError::Http { status, body }) => Err(FetchError::Http {
                status: *status,
                body: body.clone(),
            }),
            Err(FetchError::Cancelled) => Err(FetchError::Cancelled),
        }
    }

    #[async_trait]
    impl SnapshotSource for Arc<MockSource> {
        async fn fetch_snapshot(&self, _cancel: &CancellationToken) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some((delay, result)) => {
                    // Deliberately ignores the token: exercises the sequence
                    // guard at the consumption boundary.
                    tokio::time::sleep(delay).await;
                    result
                }
                None => clone_result(&self.fallback),
            }
        }
    }

    fn sample_body() -> String {
        r#"{"bus1":{"lat":"42.6381","lng":"21.1140","loc_valid":"1"}}"#.to_string()
    }

    fn sample_snapshot() -> VehicleSnapshot {
        snapshot_for("bus1")
    }

    fn snapshot_for(vehicle_id: &str) -> VehicleSnapshot {
        let mut snapshot = HashMap::new();
        snapshot.insert(
            vehicle_id.to_string(),
            VehicleLocation {
                lat: "42.6381".to_string(),
                lng: "21.1140".to_string(),
                loc_valid: "1".to_string(),
                name: None,
                speed: None,
                heading: None,
                angle: None,
                timestamp: None,
            },
        );
        snapshot
    }

    async fn test_cache() -> PersistentCache {
        // Skip the pre-acquire ping: under a paused clock its worker-thread
        // roundtrip parks the runtime and auto-advance trips the pool timeout.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .test_before_acquire(false)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::MIGRATOR.run(&pool).await.unwrap();
        PersistentCache::new(pool)
    }

    fn ingestor(
        source: Arc<MockSource>,
        cache: PersistentCache,
        offline: bool,
    ) -> (LocationIngestor<Arc<MockSource>>, network::NetworkStatusHandle) {
        let (handle, monitor) = network::channel(offline);
        let ingestor = LocationIngestor::new(
            source,
            cache,
            None,
            monitor,
            None,
            IngestOptions::default(),
        );
        (ingestor, handle)
    }

    #[tokio::test]
    async fn successful_fetch_surfaces_and_caches_the_snapshot() {
        let source = Arc::new(MockSource::always_ok(&sample_body()));
        let cache = test_cache().await;
        let (ingestor, _net) = ingestor(source.clone(), cache.clone(), false);

        ingestor.refresh().await;

        let status = ingestor.status().await;
        assert_eq!(status.data, Some(sample_snapshot()));
        assert!(!status.loading);
        assert!(!status.is_from_cache);
        assert!(status.error.is_none());
        assert!(status.last_update.is_some());
        assert_eq!(status.phase, IngestPhase::Ready { from_cache: false });

        // The cache write is fire-and-forget; give the spawned task a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cached = cache.load_snapshot().await.unwrap().unwrap();
        assert_eq!(cached.data, sample_snapshot());
    }

    #[tokio::test]
    async fn string_wrapped_bodies_get_a_second_decode_pass() {
        let wrapped = serde_json::to_string(&sample_body()).unwrap();
        let source = Arc::new(MockSource::always_ok(&wrapped));
        let (ingestor, _net) = ingestor(source, test_cache().await, false);

        ingestor.refresh().await;

        assert_eq!(ingestor.status().await.data, Some(sample_snapshot()));
    }

    #[tokio::test]
    async fn offline_serves_cache_without_touching_the_network() {
        let cache = test_cache().await;
        cache.save_snapshot(&sample_snapshot()).await.unwrap();

        let source = Arc::new(MockSource::always_ok(&sample_body()));
        let (ingestor, _net) = ingestor(source.clone(), cache, true);

        ingestor.refresh().await;

        let status = ingestor.status().await;
        assert_eq!(source.calls(), 0);
        assert!(status.is_from_cache);
        assert!(status.is_offline);
        assert_eq!(status.data, Some(sample_snapshot()));
        assert_eq!(status.error.as_deref(), Some(MSG_OFFLINE_SHOWING_SAVED));
        assert_eq!(status.phase, IngestPhase::Ready { from_cache: true });
    }

    #[tokio::test]
    async fn offline_without_cache_is_a_recoverable_error() {
        let source = Arc::new(MockSource::always_ok(&sample_body()));
        let (ingestor, _net) = ingestor(source.clone(), test_cache().await, true);

        ingestor.refresh().await;

        let status = ingestor.status().await;
        assert_eq!(source.calls(), 0);
        assert!(status.data.is_none());
        assert_eq!(status.error.as_deref(), Some(MSG_OFFLINE_NO_CACHE));
        assert_eq!(status.phase, IngestPhase::Error { recoverable: true });
    }

    #[tokio::test]
    async fn fetch_failure_falls_back_to_cache() {
        let cache = test_cache().await;
        cache.save_snapshot(&sample_snapshot()).await.unwrap();

        let source = Arc::new(MockSource::always_failing());
        let (ingestor, _net) = ingestor(source.clone(), cache, false);

        ingestor.refresh().await;

        let status = ingestor.status().await;
        assert_eq!(source.calls(), 1);
        assert!(status.is_from_cache);
        assert!(!status.is_offline);
        assert_eq!(status.data, Some(sample_snapshot()));
        let message = status.error.unwrap();
        assert!(message.contains("saved"), "message was: {}", message);
        assert_ne!(message, MSG_OFFLINE_SHOWING_SAVED);
    }

    #[tokio::test]
    async fn fetch_failure_without_cache_surfaces_the_raw_error() {
        let source = Arc::new(MockSource::always_failing());
        let (ingestor, _net) = ingestor(source, test_cache().await, false);

        ingestor.refresh().await;

        let status = ingestor.status().await;
        assert!(status.data.is_none());
        assert!(status.error.unwrap().contains("connection refused"));
        assert_eq!(status.phase, IngestPhase::Error { recoverable: true });
    }

    #[tokio::test]
    async fn parse_failure_falls_back_to_cache() {
        let cache = test_cache().await;
        cache.save_snapshot(&sample_snapshot()).await.unwrap();

        let source = Arc::new(MockSource::always_ok("definitely not json"));
        let (ingestor, _net) = ingestor(source, cache, false);

        ingestor.refresh().await;

        let status = ingestor.status().await;
        assert!(status.is_from_cache);
        assert_eq!(
            status.error.as_deref(),
            Some(MSG_REFRESH_FAILED_SHOWING_SAVED)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_the_configured_cadence() {
        // sqlx pool setup needs real time: the paused clock auto-advances past
        // the acquire timeout while the connection is opened off-runtime.
        tokio::time::resume();
        let cache = test_cache().await;
        tokio::time::pause();
        let source = Arc::new(MockSource::always_ok(&sample_body()));
        let (handle, monitor) = network::channel(false);
        let ingestor = Arc::new(LocationIngestor::new(
            source.clone(),
            cache,
            None,
            monitor,
            None::<RealtimeChannel>,
            IngestOptions {
                poll_interval: Duration::from_secs(5),
                enable_realtime: false,
            },
        ));
        drop(handle);

        let runner = ingestor.clone();
        tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 3);

        ingestor.shutdown();
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cycle_results_are_discarded() {
        // sqlx pool setup needs real time: the paused clock auto-advances past
        // the acquire timeout while the connection is opened off-runtime.
        tokio::time::resume();
        let cache = test_cache().await;
        tokio::time::pause();
        let source = Arc::new(MockSource::scripted(vec![
            (
                Duration::from_secs(2),
                Ok(r#"{"slow":{"lat":"1","lng":"1","loc_valid":"1"}}"#.to_string()),
            ),
            (
                Duration::ZERO,
                Ok(r#"{"fresh":{"lat":"2","lng":"2","loc_valid":"1"}}"#.to_string()),
            ),
        ]));
        let (ingestor, _net) = ingestor(source.clone(), cache, false);
        let ingestor = Arc::new(ingestor);

        let slow = ingestor.clone();
        let slow_task = tokio::spawn(async move { slow.refresh().await });
        // Let the slow cycle issue its request before superseding it.
        tokio::time::sleep(Duration::from_millis(10)).await;

        ingestor.refresh().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        slow_task.await.unwrap();

        let status = ingestor.status().await;
        let data = status.data.unwrap();
        assert!(data.contains_key("fresh"));
        assert!(!data.contains_key("slow"));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let source = Arc::new(MockSource::always_ok(&sample_body()));
        let (ingestor, _net) = ingestor(source, test_cache().await, false);
        ingestor.shutdown();
        ingestor.shutdown();
        ingestor.shutdown();
    }

    #[tokio::test]
    async fn subscribers_observe_the_loading_transition() {
        let source = Arc::new(MockSource::always_ok(&sample_body()));
        let (ingestor, _net) = ingestor(source, test_cache().await, false);
        let mut updates = ingestor.subscribe();

        ingestor.refresh().await;

        let first = updates.recv().await.unwrap();
        assert!(first.loading);
        assert_eq!(first.phase, IngestPhase::Loading);
        let second = updates.recv().await.unwrap();
        assert!(!second.loading);
        assert_eq!(second.phase, IngestPhase::Ready { from_cache: false });
    }

    /// Scripted push transport standing in for the websocket channel.
    struct FakeFeed {
        open: Arc<AtomicBool>,
        updates_tx: broadcast::Sender<VehicleSnapshot>,
    }

    impl FakeFeed {
        fn new(open: bool) -> (Self, Arc<AtomicBool>, broadcast::Sender<VehicleSnapshot>) {
            let (updates_tx, _) = broadcast::channel(16);
            let open = Arc::new(AtomicBool::new(open));
            let feed = Self {
                open: open.clone(),
                updates_tx: updates_tx.clone(),
            };
            (feed, open, updates_tx)
        }
    }

    impl RealtimeFeed for FakeFeed {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn subscribe(&self) -> broadcast::Receiver<VehicleSnapshot> {
            self.updates_tx.subscribe()
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    fn ingestor_with_feed(
        source: Arc<MockSource>,
        cache: PersistentCache,
        feed: FakeFeed,
    ) -> Arc<LocationIngestor<Arc<MockSource>, FakeFeed>> {
        let (handle, monitor) = network::channel(false);
        drop(handle);
        Arc::new(LocationIngestor::new(
            source,
            cache,
            None,
            monitor,
            Some(feed),
            IngestOptions {
                poll_interval: Duration::from_secs(5),
                enable_realtime: true,
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_snapshots_follow_the_full_success_path() {
        // sqlx pool setup needs real time: the paused clock auto-advances past
        // the acquire timeout while the connection is opened off-runtime.
        tokio::time::resume();
        let cache = test_cache().await;
        tokio::time::pause();
        let source = Arc::new(MockSource::always_ok(&sample_body()));
        let (feed, _open, push_tx) = FakeFeed::new(true);
        let ingestor = ingestor_with_feed(source.clone(), cache.clone(), feed);

        let runner = ingestor.clone();
        tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let pushed = snapshot_for("pushed1");
        push_tx
            .send(pushed.clone())
            .expect("forwarding task not subscribed");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = ingestor.status().await;
        assert_eq!(status.data, Some(pushed.clone()));
        assert!(!status.is_from_cache);
        assert!(status.error.is_none());
        assert!(status.last_update.is_some());
        assert_eq!(status.phase, IngestPhase::Ready { from_cache: false });

        // Pushed payloads reach the persistent cache like fetched ones do.
        // Resume real time first: the cache write runs on a real worker
        // thread, so a paused-clock sleep would not actually give it a beat.
        tokio::time::resume();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let cached = cache.load_snapshot().await.unwrap().unwrap();
        assert_eq!(cached.data, pushed);

        ingestor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn poll_ticks_are_skipped_while_the_feed_is_open() {
        // sqlx pool setup needs real time: the paused clock auto-advances past
        // the acquire timeout while the connection is opened off-runtime.
        tokio::time::resume();
        let cache = test_cache().await;
        tokio::time::pause();
        let source = Arc::new(MockSource::always_ok(&sample_body()));
        let (feed, open, _push_tx) = FakeFeed::new(true);
        let ingestor = ingestor_with_feed(source.clone(), cache, feed);

        let runner = ingestor.clone();
        tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 1);

        // Open feed: the tick passes without a fetch.
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 1);

        // The feed drops out of the open state: polling resumes on the next
        // tick with no explicit coordination.
        open.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 2);

        ingestor.shutdown();
    }
}
