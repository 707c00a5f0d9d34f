//! Static table of monitored locations.

use serde::{Deserialize, Serialize};

/// A monitored geographic point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Stable identifier, used for the provider query and destination lookup
    pub location_id: String,

    pub latitude: f64,

    pub longitude: f64,
}

impl Location {
    pub fn new(location_id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            location_id: location_id.into(),
            latitude,
            longitude,
        }
    }
}

/// Locations forwarded on every run, in processing order.
pub fn default_locations() -> Vec<Location> {
    vec![
        Location::new("bangkok", 13.7563, 100.5018),
        Location::new("ayutthaya", 14.3550, 100.5650),
    ]
}
