use serde::Deserialize;
use std::path::Path;

use crate::services::progress::RouteProfile;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// REST endpoint that serves the full vehicle snapshot.
    pub rest_url: String,
    /// Websocket endpoint for pushed snapshots. Optional; polling covers
    /// everything when absent.
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Whether to open the realtime channel at all (default: true).
    #[serde(default = "Config::default_enable_realtime")]
    pub enable_realtime: bool,
    /// Seconds between poll cycles (default: 10)
    #[serde(default = "Config::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// SQLite database for the snapshot cache and the mirror table.
    #[serde(default = "Config::default_database_url")]
    pub database_url: String,
    /// Vehicle whose route progress gets logged, if any.
    #[serde(default)]
    pub track_vehicle: Option<String>,
    /// The shuttle route the progress tracker runs against.
    pub route: RouteProfile,
}

impl Config {
    fn default_enable_realtime() -> bool {
        true
    }
    fn default_poll_interval_secs() -> u64 {
        10
    }
    fn default_database_url() -> String {
        "sqlite:database/tracker.db?mode=rwc".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
