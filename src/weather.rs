//! Weather reading fetcher.
//!
//! This module queries the provider's current-conditions endpoint for one
//! location and normalizes the response into a [`WeatherReading`]. Fields
//! the provider leaves out stay `None`; they are never replaced with zeros.
//! Numbers keep the form the provider used, so an integer humidity of `70`
//! is forwarded as `70`, not `70.0`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;
use tracing::debug;

use crate::location::Location;

/// Maximum number of body characters kept in diagnostics.
const DIAGNOSTIC_BODY_LIMIT: usize = 256;

/// Canonical reading produced by one successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    /// Provider observation time, passed through untouched
    pub timestamp: Option<String>,

    pub temperature_c: Option<Number>,

    pub humidity_percent: Option<Number>,

    pub uv_index: Option<Number>,
}

/// Subset of the provider response the forwarder relies on.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentConditions {
    #[serde(default)]
    current_time: Option<String>,

    #[serde(default)]
    temperature: Option<Temperature>,

    #[serde(default)]
    relative_humidity: Option<Number>,

    #[serde(default)]
    uv_index: Option<Number>,
}

#[derive(Debug, Default, Deserialize)]
struct Temperature {
    #[serde(default)]
    degrees: Option<Number>,
}

impl From<CurrentConditions> for WeatherReading {
    fn from(conditions: CurrentConditions) -> Self {
        Self {
            timestamp: conditions.current_time,
            temperature_c: conditions.temperature.and_then(|t| t.degrees),
            humidity_percent: conditions.relative_humidity,
            uv_index: conditions.uv_index,
        }
    }
}

impl WeatherReading {
    /// Parse a provider response body. The body must be a JSON object;
    /// arrays, scalars and `null` are rejected rather than read as empty.
    pub fn from_json(body: &str) -> Result<Self, FetchErrorKind> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| FetchErrorKind::Parse(e.to_string()))?;

        if !value.is_object() {
            return Err(FetchErrorKind::Parse(format!(
                "expected a JSON object, got {}",
                json_kind(&value)
            )));
        }

        let conditions: CurrentConditions =
            serde_json::from_value(value).map_err(|e| FetchErrorKind::Parse(e.to_string()))?;
        Ok(conditions.into())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Cause of a failed fetch.
#[derive(Debug, Error)]
pub enum FetchErrorKind {
    #[error("request timed out")]
    Timeout,

    #[error("HTTP request failed: {0}")]
    Request(reqwest::Error),

    #[error("provider returned {code}: {body}")]
    Status { code: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for FetchErrorKind {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchErrorKind::Timeout
        } else {
            // The request URL carries the API key in its query string
            FetchErrorKind::Request(err.without_url())
        }
    }
}

/// A fetch failure scoped to a single location.
#[derive(Debug, Error)]
#[error("weather fetch failed for {location_id}: {kind}")]
pub struct FetchError {
    pub location_id: String,

    #[source]
    pub kind: FetchErrorKind,
}

impl FetchError {
    pub fn new(location_id: impl Into<String>, kind: FetchErrorKind) -> Self {
        Self {
            location_id: location_id.into(),
            kind,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FetchErrorKind::Timeout)
    }
}

/// Source of current weather readings.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Fetch the current reading for `location`, bounded by `timeout`.
    async fn fetch(
        &self,
        api_key: &str,
        location: &Location,
        timeout: Duration,
    ) -> Result<WeatherReading, FetchError>;
}

/// Google Weather current-conditions client.
///
/// The underlying `reqwest::Client` is built once and reused, so pooled
/// connections to the provider survive across runs.
pub struct GoogleWeatherClient {
    client: Client,
    url: String,
}

impl GoogleWeatherClient {
    /// Create a client for the given endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the HTTP client cannot be constructed.
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(
        &self,
        api_key: &str,
        location: &Location,
        timeout: Duration,
    ) -> Result<WeatherReading, FetchErrorKind> {
        let response = self
            .client
            .get(&self.url)
            .timeout(timeout)
            .query(&[
                ("key", api_key.to_string()),
                ("location.latitude", location.latitude.to_string()),
                ("location.longitude", location.longitude.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        debug!(
            location_id = %location.location_id,
            status = status.as_u16(),
            body = %truncate(&body, DIAGNOSTIC_BODY_LIMIT),
            "Weather provider responded"
        );

        if !status.is_success() {
            return Err(FetchErrorKind::Status {
                code: status,
                body: truncate(&body, DIAGNOSTIC_BODY_LIMIT).to_string(),
            });
        }

        WeatherReading::from_json(&body)
    }
}

#[async_trait]
impl WeatherProvider for GoogleWeatherClient {
    async fn fetch(
        &self,
        api_key: &str,
        location: &Location,
        timeout: Duration,
    ) -> Result<WeatherReading, FetchError> {
        self.request(api_key, location, timeout)
            .await
            .map_err(|kind| FetchError::new(location.location_id.clone(), kind))
    }
}

/// Cut `text` to at most `limit` characters on a char boundary.
fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
