use std::sync::Arc;

use sqlx::SqlitePool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shuttle_tracker::cache::PersistentCache;
use shuttle_tracker::config::Config;
use shuttle_tracker::providers::fetch::{RetryPolicy, RetryingFetcher};
use shuttle_tracker::providers::realtime::{RealtimeChannel, RealtimeOptions};
use shuttle_tracker::services::ingest::{IngestOptions, LocationIngestor, RestSource};
use shuttle_tracker::services::network::NetworkMonitor;
use shuttle_tracker::services::progress::{RouteProgressTracker, NO_PROGRESS};
use shuttle_tracker::sync::SyncSink;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    tracing::info!(
        stops = config.route.stops.len(),
        poll_interval_secs = config.poll_interval_secs,
        "Loaded configuration"
    );

    // Initialize SQLite database
    let pool = SqlitePool::connect(&config.database_url)
        .await
        .expect("Failed to connect to SQLite database");

    // Run migrations
    shuttle_tracker::MIGRATOR
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    tracing::info!("Database migrations completed");

    let fetcher =
        RetryingFetcher::new(RetryPolicy::poll()).expect("Failed to build HTTP transport");
    let source = RestSource::new(config.rest_url.clone(), fetcher);

    let realtime = match (&config.ws_url, config.enable_realtime) {
        (Some(url), true) => Some(RealtimeChannel::connect(
            url.clone(),
            RealtimeOptions::default(),
        )),
        _ => None,
    };

    let ingestor = Arc::new(LocationIngestor::new(
        source,
        PersistentCache::new(pool.clone()),
        Some(SyncSink::new(pool)),
        NetworkMonitor::always_online(),
        realtime,
        IngestOptions {
            poll_interval: std::time::Duration::from_secs(config.poll_interval_secs),
            enable_realtime: config.enable_realtime,
        },
    ));

    let mut updates = ingestor.subscribe();
    let runner = ingestor.clone();
    tokio::spawn(async move {
        runner.start().await;
    });

    let mut tracker = RouteProgressTracker::new(config.route.clone());
    let tracked = config.track_vehicle.as_deref();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                ingestor.shutdown();
                break;
            }
            update = updates.recv() => {
                let status = match update {
                    Ok(status) => status,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Status updates lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                tracing::info!(
                    vehicles = status.data.as_ref().map(|d| d.len()).unwrap_or(0),
                    from_cache = status.is_from_cache,
                    offline = status.is_offline,
                    error = status.error.as_deref().unwrap_or(""),
                    "Snapshot update"
                );

                if let Some(vehicle_id) = tracked {
                    let index = tracker.update(Some(vehicle_id), status.data.as_ref());
                    if index != NO_PROGRESS {
                        let stop = &tracker.route().stops[index as usize];
                        tracing::info!(vehicle_id, stop_index = index, stop = %stop.name, "Route progress");
                    }
                }
            }
        }
    }
}
