//! Versioned telemetry envelope sent to device destinations.

use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::weather::WeatherReading;

pub const SCHEMA_VERSION: &str = "v1";

pub const SOURCE: &str = "google-weather";

/// Wire record for one location's reading.
///
/// Field names are part of the downstream contract. Absent readings
/// serialize as `null`; present ones keep the provider's number form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,

    pub source: String,

    #[serde(rename = "locationId")]
    pub location_id: String,

    pub timestamp: Option<String>,

    pub temp: Option<Number>,

    pub humi: Option<Number>,

    pub uv_index: Option<Number>,
}

impl TelemetryEnvelope {
    /// Flatten `reading` into an envelope for `location_id`.
    pub fn build(location_id: &str, reading: &WeatherReading) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            source: SOURCE.to_string(),
            location_id: location_id.to_string(),
            timestamp: reading.timestamp.clone(),
            temp: reading.temperature_c.clone(),
            humi: reading.humidity_percent.clone(),
            uv_index: reading.uv_index.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
