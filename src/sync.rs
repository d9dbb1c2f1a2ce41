use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::VehicleSnapshot;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(String),
}

/// Durable sink for fresh snapshots: inserts vehicles it has never seen and
/// updates the rest by id. Callers must treat failures as non-fatal; an
/// outage here must never degrade live tracking.
#[derive(Clone)]
pub struct SyncSink {
    pool: SqlitePool,
}

impl SyncSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert every vehicle with trusted coordinates. Vehicles with
    /// `loc_valid` unset are skipped rather than persisted as garbage.
    pub async fn sync_snapshot(&self, snapshot: &VehicleSnapshot) -> Result<(), SyncError> {
        let valid: Vec<_> = snapshot
            .iter()
            .filter(|(_, location)| location.is_valid())
            .collect();

        if valid.is_empty() {
            debug!("No valid vehicles in snapshot, skipping sync");
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let count = valid.len();

        for (vehicle_id, location) in valid {
            sqlx::query(
                r#"
                INSERT INTO vehicle_locations (vehicle_id, latitude, longitude, heading, speed, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(vehicle_id) DO UPDATE SET
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    heading = excluded.heading,
                    speed = excluded.speed,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(vehicle_id)
            .bind(&location.lat)
            .bind(&location.lng)
            .bind(location.heading_or_default())
            .bind(location.speed.as_deref().unwrap_or("0"))
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;
        }

        info!(vehicles = count, "Synced snapshot to durable store");
        Ok(())
    }
}
