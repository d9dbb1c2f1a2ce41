use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw location report for a single vehicle, exactly as the tracking feed
/// delivers it: coordinates are decimal strings and validity is a '0'/'1'
/// flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleLocation {
    pub lat: String,
    pub lng: String,
    /// '1' when the reported coordinates can be trusted
    pub loc_valid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    /// Some feed versions report the heading under `angle` instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl VehicleLocation {
    pub fn is_valid(&self) -> bool {
        self.loc_valid == "1"
    }

    /// Parsed latitude/longitude, or `None` when either string is not a number.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let lat: f64 = self.lat.trim().parse().ok()?;
        let lng: f64 = self.lng.trim().parse().ok()?;
        if lat.is_nan() || lng.is_nan() {
            return None;
        }
        Some((lat, lng))
    }

    /// Heading with the legacy `angle` field as fallback, defaulting to "0".
    pub fn heading_or_default(&self) -> &str {
        self.heading
            .as_deref()
            .or(self.angle.as_deref())
            .unwrap_or("0")
    }
}

/// The feed timestamps are either epoch millis or an ISO 8601 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Iso(String),
}

/// Complete point-in-time mapping of vehicle id to location. Each poll or
/// push cycle fully replaces the previous snapshot; nothing is merged.
pub type VehicleSnapshot = HashMap<String, VehicleLocation>;

/// Snapshot restored from the persistent cache together with the time it was
/// originally fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSnapshot {
    pub data: VehicleSnapshot,
    pub last_update: Option<DateTime<Utc>>,
}

/// One stop along the route. Position in the stop list is significant:
/// index 0 is the origin, the last index the terminus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStop {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Decode a snapshot payload. The upstream feed occasionally delivers the
/// JSON object wrapped in a JSON string; a body that decodes to a string gets
/// one extra decode pass.
pub fn parse_snapshot(body: &str) -> Result<VehicleSnapshot, serde_json::Error> {
    match serde_json::from_str::<serde_json::Value>(body)? {
        serde_json::Value::String(inner) => serde_json::from_str(&inner),
        value => serde_json::from_value(value),
    }
}
