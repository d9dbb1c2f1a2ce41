//! Route progress inference for a there-and-back shuttle route.
//!
//! Raw closest-stop computation over GPS samples is noisy and non-monotonic,
//! especially near clustered stops. This module layers a small state machine
//! on top: progress only moves forward, the direction flips exactly once at
//! the designated turnaround stop, and a completed loop resets at the
//! terminus once the vehicle has demonstrably left and come back.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{RouteStop, VehicleSnapshot};

/// Meters per degree at the route's latitude. Only locally valid: the fixed
/// scale ignores longitude compression by latitude cosine, which is
/// acceptable for a short route at one latitude but must be revisited if the
/// route ever moves region.
const DEGREES_TO_METERS: f64 = 111_000.0;

/// Returned when no progress can be inferred for the selected vehicle.
pub const NO_PROGRESS: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Return,
}

/// Per-vehicle tracking state. `left_terminus` records that the vehicle,
/// having finished a return leg, moved beyond the restart threshold; the
/// next terminus approach then starts a fresh loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressState {
    pub stop_index: usize,
    pub direction: Direction,
    left_terminus: bool,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            stop_index: 0,
            direction: Direction::Outbound,
            left_terminus: false,
        }
    }
}

/// Distance thresholds in meters for the progress state machine.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressThresholds {
    /// Within this distance a stop counts as "reached" when ahead of the
    /// current progress.
    #[serde(default = "ProgressThresholds::default_stop_proximity_m")]
    pub stop_proximity_m: f64,
    /// Tighter radius that also confirms the current stop (no flicker).
    #[serde(default = "ProgressThresholds::default_exact_match_m")]
    pub exact_match_m: f64,
    /// Proximity to the turnaround stop that flips the direction.
    #[serde(default = "ProgressThresholds::default_turnaround_trigger_m")]
    pub turnaround_trigger_m: f64,
    /// Distance from the terminus beyond which a finished vehicle counts as
    /// departed, arming the loop reset.
    #[serde(default = "ProgressThresholds::default_restart_m")]
    pub restart_m: f64,
}

impl Default for ProgressThresholds {
    fn default() -> Self {
        Self {
            stop_proximity_m: Self::default_stop_proximity_m(),
            exact_match_m: Self::default_exact_match_m(),
            turnaround_trigger_m: Self::default_turnaround_trigger_m(),
            restart_m: Self::default_restart_m(),
        }
    }
}

impl ProgressThresholds {
    fn default_stop_proximity_m() -> f64 {
        200.0
    }
    fn default_exact_match_m() -> f64 {
        100.0
    }
    fn default_turnaround_trigger_m() -> f64 {
        150.0
    }
    fn default_restart_m() -> f64 {
        300.0
    }
}

/// Static route description: the ordered stop list, the stop whose proximity
/// flips the direction, and the thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteProfile {
    pub stops: Vec<RouteStop>,
    pub turnaround_index: usize,
    #[serde(default)]
    pub thresholds: ProgressThresholds,
}

/// Flat-earth distance in meters. See [`DEGREES_TO_METERS`] for the validity
/// constraint.
fn flat_distance_m(lat_a: f64, lng_a: f64, lat_b: f64, lng_b: f64) -> f64 {
    ((lat_a - lat_b).powi(2) + (lng_a - lng_b).powi(2)).sqrt() * DEGREES_TO_METERS
}

/// Infers the current stop index for a selected vehicle and keeps the
/// per-vehicle state between evaluations.
pub struct RouteProgressTracker {
    route: RouteProfile,
    state: HashMap<String, ProgressState>,
}

impl RouteProgressTracker {
    pub fn new(route: RouteProfile) -> Self {
        Self {
            route,
            state: HashMap::new(),
        }
    }

    /// Evaluate the selected vehicle against the route. Returns the current
    /// stop index, or [`NO_PROGRESS`] when nothing can be inferred (no
    /// selection, missing vehicle, untrusted or unparseable coordinates,
    /// empty stop list). Invalid inputs never mutate stored state.
    pub fn update(&mut self, selected: Option<&str>, snapshot: Option<&VehicleSnapshot>) -> i32 {
        let vehicle_id = match selected {
            Some(id) => id,
            None => return NO_PROGRESS,
        };
        let snapshot = match snapshot {
            Some(s) => s,
            None => return NO_PROGRESS,
        };
        if self.route.stops.is_empty() {
            return NO_PROGRESS;
        }
        let location = match snapshot.get(vehicle_id) {
            Some(l) if l.is_valid() => l,
            _ => return NO_PROGRESS,
        };
        let (lat, lng) = match location.coordinates() {
            Some(coords) => coords,
            None => return NO_PROGRESS,
        };

        let current = self
            .state
            .get(vehicle_id)
            .copied()
            .unwrap_or_default();
        let last_index = self.route.stops.len() - 1;
        let thresholds = &self.route.thresholds;

        // Closest stop wins; strict comparison keeps the lowest index on
        // ties, which is the conservative choice for a no-skip policy.
        let mut closest_index = 0usize;
        let mut min_distance = f64::INFINITY;
        for (index, stop) in self.route.stops.iter().enumerate() {
            let distance = flat_distance_m(lat, lng, stop.latitude, stop.longitude);
            if distance < min_distance {
                min_distance = distance;
                closest_index = index;
            }
        }

        let mut next = current;

        // Reaching the turnaround stop flips an outbound vehicle onto its
        // return leg.
        if closest_index == self.route.turnaround_index
            && min_distance < thresholds.turnaround_trigger_m
            && current.direction == Direction::Outbound
        {
            next.direction = Direction::Return;
        }

        // A finished vehicle that moves away from the terminus arms the loop
        // reset for its next approach.
        let terminus = &self.route.stops[last_index];
        let terminus_distance = flat_distance_m(lat, lng, terminus.latitude, terminus.longitude);
        if current.direction == Direction::Return
            && current.stop_index == last_index
            && terminus_distance > thresholds.restart_m
        {
            next.left_terminus = true;
        }

        // The origin and terminus are geographically coincident, so proximity
        // to either endpoint is resolved by direction.
        let near_endpoint = min_distance < thresholds.stop_proximity_m
            && (closest_index == 0 || closest_index == last_index);

        if near_endpoint {
            if next.direction == Direction::Return {
                next.stop_index = last_index;
                if next.left_terminus {
                    // The vehicle left after finishing and is back: new loop.
                    next.stop_index = 0;
                    next.direction = Direction::Outbound;
                    next.left_terminus = false;
                }
            } else {
                next.stop_index = 0;
            }
        } else if closest_index > current.stop_index && min_distance < thresholds.stop_proximity_m
        {
            next.stop_index = closest_index;
        } else if min_distance < thresholds.exact_match_m && closest_index >= current.stop_index {
            next.stop_index = closest_index;
        }
        // Otherwise the vehicle is between stops; progress holds.

        if next != current {
            self.state.insert(vehicle_id.to_string(), next);
        }

        next.stop_index as i32
    }

    /// Drop the retained state for a deselected vehicle so the map stays
    /// bounded by the number of vehicles actually being watched.
    pub fn deselect(&mut self, vehicle_id: &str) {
        self.state.remove(vehicle_id);
    }

    pub fn state_for(&self, vehicle_id: &str) -> Option<ProgressState> {
        self.state.get(vehicle_id).copied()
    }

    pub fn route(&self) -> &RouteProfile {
        &self.route
    }
}
