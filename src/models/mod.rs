pub mod vehicle;

pub use vehicle::{
    parse_snapshot, CachedSnapshot, RouteStop, Timestamp, VehicleLocation, VehicleSnapshot,
};
