//! Configuration module for the weather forwarder.
//!
//! Two layers of configuration exist:
//!
//! - [`ServiceConfig`]: process settings (provider URL, timeouts, schedule),
//!   loaded once at startup with defaults and range checks.
//! - [`RunConfig`]: credentials required by a single run (provider API key and
//!   one device connection string per location). These are read fresh on
//!   every run and are all-or-nothing.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::location::Location;

/// Default Google Weather current-conditions endpoint
pub const DEFAULT_WEATHER_URL: &str = "https://weather.googleapis.com/v1/currentConditions:lookup";

/// Environment variable holding the provider API key
pub const API_KEY_VAR: &str = "GOOGLE_API_KEY";

/// Prefix of the per-location device connection string variables
pub const DESTINATION_VAR_PREFIX: &str = "IOT_CONN";

/// Default provider request timeout in seconds
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

const MIN_FETCH_TIMEOUT_SECS: u64 = 1;
const MAX_FETCH_TIMEOUT_SECS: u64 = 120;

/// Default time between scheduled runs (15 minutes)
const DEFAULT_RUN_INTERVAL_SECS: u64 = 900;

const MIN_RUN_INTERVAL_SECS: u64 = 60;
const MAX_RUN_INTERVAL_SECS: u64 = 86_400;

/// Default bound on establishing a device connection
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

const MIN_CONNECT_TIMEOUT_SECS: u64 = 1;
const MAX_CONNECT_TIMEOUT_SECS: u64 = 300;

/// Default wait for the destination to acknowledge a message
const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;

const MIN_PUBLISH_TIMEOUT_SECS: u64 = 1;
const MAX_PUBLISH_TIMEOUT_SECS: u64 = 120;

/// Errors raised while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// One or more required variables are unset or empty
    #[error("Missing required configuration: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    /// A variable is set but its value is unusable
    #[error("Configuration error for {var}: {message}")]
    Invalid { var: String, message: String },
}

/// Process-level settings for the forwarder service.
///
/// All settings can be configured via environment variables:
/// - `WEATHER_API_URL`: provider endpoint (default: Google Weather current conditions)
/// - `WEATHER_FETCH_TIMEOUT_SECS`: provider request timeout (default: 10)
/// - `WEATHER_RUN_INTERVAL_SECS`: seconds between runs (default: 900)
/// - `WEATHER_RUN_ONCE`: perform a single run and exit (default: false)
/// - `WEATHER_CONNECT_TIMEOUT_SECS`: device connect timeout (default: 30)
/// - `WEATHER_PUBLISH_TIMEOUT_SECS`: wait for a telemetry acknowledgement (default: 10)
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Provider endpoint for current conditions
    pub weather_url: String,

    /// Timeout applied to each provider request
    pub fetch_timeout: Duration,

    /// Time between scheduled runs
    pub run_interval: Duration,

    /// Perform a single run and exit instead of scheduling
    pub run_once: bool,

    /// Bound on establishing a device connection
    pub connect_timeout: Duration,

    /// Bound on waiting for the destination to acknowledge one message
    pub publish_timeout: Duration,
}

impl ServiceConfig {
    /// Load service settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if a numeric or boolean variable does not
    /// parse or falls outside its allowed range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let weather_url = env::var("WEATHER_API_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WEATHER_URL.to_string());

        let fetch_timeout = Duration::from_secs(parse_bounded_secs(
            "WEATHER_FETCH_TIMEOUT_SECS",
            DEFAULT_FETCH_TIMEOUT_SECS,
            MIN_FETCH_TIMEOUT_SECS,
            MAX_FETCH_TIMEOUT_SECS,
        )?);

        let run_interval = Duration::from_secs(parse_bounded_secs(
            "WEATHER_RUN_INTERVAL_SECS",
            DEFAULT_RUN_INTERVAL_SECS,
            MIN_RUN_INTERVAL_SECS,
            MAX_RUN_INTERVAL_SECS,
        )?);

        let connect_timeout = Duration::from_secs(parse_bounded_secs(
            "WEATHER_CONNECT_TIMEOUT_SECS",
            DEFAULT_CONNECT_TIMEOUT_SECS,
            MIN_CONNECT_TIMEOUT_SECS,
            MAX_CONNECT_TIMEOUT_SECS,
        )?);

        let publish_timeout = Duration::from_secs(parse_bounded_secs(
            "WEATHER_PUBLISH_TIMEOUT_SECS",
            DEFAULT_PUBLISH_TIMEOUT_SECS,
            MIN_PUBLISH_TIMEOUT_SECS,
            MAX_PUBLISH_TIMEOUT_SECS,
        )?);

        let run_once = parse_flag("WEATHER_RUN_ONCE")?;

        Ok(Self {
            weather_url,
            fetch_timeout,
            run_interval,
            run_once,
            connect_timeout,
            publish_timeout,
        })
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            weather_url: DEFAULT_WEATHER_URL.to_string(),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            run_interval: Duration::from_secs(DEFAULT_RUN_INTERVAL_SECS),
            run_once: false,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            publish_timeout: Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS),
        }
    }
}

/// Parse a seconds value from the environment, enforcing `min..=max`.
fn parse_bounded_secs(env_var: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
    match env::var(env_var) {
        Ok(value) => {
            let secs: u64 = value.trim().parse().map_err(|_| ConfigError::Invalid {
                var: env_var.to_string(),
                message: format!("'{}' is not a valid number", value),
            })?;

            if secs < min {
                return Err(ConfigError::Invalid {
                    var: env_var.to_string(),
                    message: format!("{} is below minimum ({}s)", secs, min),
                });
            }

            if secs > max {
                return Err(ConfigError::Invalid {
                    var: env_var.to_string(),
                    message: format!("{} exceeds maximum ({}s)", secs, max),
                });
            }

            Ok(secs)
        }
        Err(_) => Ok(default),
    }
}

fn parse_flag(env_var: &str) -> Result<bool, ConfigError> {
    match env::var(env_var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "" | "0" | "false" | "no" => Ok(false),
            other => Err(ConfigError::Invalid {
                var: env_var.to_string(),
                message: format!("'{}' is not a valid boolean", other),
            }),
        },
        Err(_) => Ok(false),
    }
}

/// Name of the variable holding a location's device connection string,
/// e.g. `IOT_CONN_BANGKOK`.
pub fn destination_var(location_id: &str) -> String {
    format!("{}_{}", DESTINATION_VAR_PREFIX, location_id.to_uppercase())
}

/// A location paired with the destination its telemetry goes to.
#[derive(Clone)]
pub struct RunTarget {
    pub location: Location,
    pub destination: String,
}

/// Credentials required by a single run.
///
/// Either every value is present or the run has no configuration at all, so
/// every location of a built config has a destination.
#[derive(Clone)]
pub struct RunConfig {
    api_key: String,
    targets: Vec<RunTarget>,
}

impl RunConfig {
    /// Resolve run credentials for `locations` from the process environment.
    pub fn from_env(locations: &[Location]) -> Result<Self, ConfigError> {
        Self::from_lookup(locations, |name| env::var(name).ok())
    }

    /// Resolve run credentials through `lookup`.
    ///
    /// Empty values count as missing. The error lists every missing variable.
    pub fn from_lookup<F>(locations: &[Location], lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut missing = Vec::new();

        let api_key = present(API_KEY_VAR);
        if api_key.is_none() {
            missing.push(API_KEY_VAR.to_string());
        }

        let mut targets = Vec::with_capacity(locations.len());
        for location in locations {
            let var = destination_var(&location.location_id);
            match present(&var) {
                Some(destination) => targets.push(RunTarget {
                    location: location.clone(),
                    destination,
                }),
                None => missing.push(var),
            }
        }

        match api_key {
            Some(api_key) if missing.is_empty() => Ok(Self { api_key, targets }),
            _ => Err(ConfigError::MissingVariables(missing)),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Locations with their destinations, in configuration order.
    pub fn targets(&self) -> &[RunTarget] {
        &self.targets
    }

    /// Destination identifier configured for `location_id`.
    pub fn destination(&self, location_id: &str) -> Option<&str> {
        self.targets
            .iter()
            .find(|t| t.location.location_id == location_id)
            .map(|t| t.destination.as_str())
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let locations: Vec<&str> = self
            .targets
            .iter()
            .map(|t| t.location.location_id.as_str())
            .collect();
        f.debug_struct("RunConfig")
            .field("api_key", &"<redacted>")
            .field("destinations", &locations)
            .finish()
    }
}
