//! Run orchestrator.
//!
//! One call to [`RunOrchestrator::run`] is one scheduled run:
//!
//! 1. Resolve [`RunConfig`] fresh from the configuration source. If anything
//!    is missing the run is aborted before any network call.
//! 2. Walk the locations in configuration order. For each one: fetch, build
//!    the envelope, acquire the destination connection, send.
//! 3. Report a [`RunSummary`].
//!
//! Failures are scoped to the location they happen in. A fetch failure skips
//! the location; a connect or send failure marks it failed. Neither stops the
//! remaining locations, and `run` itself never returns an error.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Number;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, RunConfig, RunTarget};
use crate::envelope::TelemetryEnvelope;
use crate::location::Location;
use crate::registry::ConnectionRegistry;
use crate::weather::WeatherProvider;

/// Lookup used to resolve run credentials by variable name.
pub type ConfigSource = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// What happened to one location during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LocationOutcome {
    Sent,
    Skipped { reason: String },
    SendFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationReport {
    pub location_id: String,
    #[serde(flatten)]
    pub outcome: LocationOutcome,
}

/// Counts and per-location results of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub locations: Vec<LocationReport>,
}

impl RunSummary {
    fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        locations: Vec<LocationReport>,
    ) -> Self {
        let count = |pred: fn(&LocationOutcome) -> bool| {
            locations.iter().filter(|r| pred(&r.outcome)).count()
        };
        let sent = count(|o| matches!(o, LocationOutcome::Sent));
        let skipped = count(|o| matches!(o, LocationOutcome::Skipped { .. }));
        let failed = count(|o| matches!(o, LocationOutcome::SendFailed { .. }));

        Self {
            run_id,
            started_at,
            finished_at,
            sent,
            skipped,
            failed,
            locations,
        }
    }

    pub fn outcome_for(&self, location_id: &str) -> Option<&LocationOutcome> {
        self.locations
            .iter()
            .find(|r| r.location_id == location_id)
            .map(|r| &r.outcome)
    }
}

/// Result of one run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Configuration was incomplete; nothing was attempted
    Aborted(ConfigError),

    /// Every location was attempted
    Completed(RunSummary),
}

impl RunOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RunOutcome::Aborted(_))
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            RunOutcome::Completed(summary) => Some(summary),
            RunOutcome::Aborted(_) => None,
        }
    }
}

/// Drives fetch -> build -> send for every configured location.
pub struct RunOrchestrator {
    locations: Vec<Location>,
    provider: Arc<dyn WeatherProvider>,
    registry: Arc<ConnectionRegistry>,
    fetch_timeout: Duration,
    config_source: ConfigSource,
}

impl RunOrchestrator {
    /// Create an orchestrator that reads run credentials from the process
    /// environment.
    pub fn new(
        locations: Vec<Location>,
        provider: Arc<dyn WeatherProvider>,
        registry: Arc<ConnectionRegistry>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            locations,
            provider,
            registry,
            fetch_timeout,
            config_source: Arc::new(|name| env::var(name).ok()),
        }
    }

    /// Replace the credential lookup.
    pub fn with_config_source(mut self, source: ConfigSource) -> Self {
        self.config_source = source;
        self
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Execute one run. Never fails; the outcome is reported as a value.
    pub async fn run(&self) -> RunOutcome {
        let run_id = Uuid::new_v4();
        self.execute(run_id)
            .instrument(info_span!("run", run_id = %run_id))
            .await
    }

    async fn execute(&self, run_id: Uuid) -> RunOutcome {
        info!(locations = self.locations.len(), "Weather run started");
        let started_at = Utc::now();

        let config = match RunConfig::from_lookup(&self.locations, |name| (self.config_source)(name)) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Weather run aborted");
                return RunOutcome::Aborted(e);
            }
        };

        let mut reports = Vec::with_capacity(config.targets().len());
        for target in config.targets() {
            let outcome = self.process_location(config.api_key(), target).await;
            reports.push(LocationReport {
                location_id: target.location.location_id.clone(),
                outcome,
            });
        }

        let summary = RunSummary::new(run_id, started_at, Utc::now(), reports);
        info!(
            sent = summary.sent,
            skipped = summary.skipped,
            failed = summary.failed,
            "Weather run finished"
        );

        RunOutcome::Completed(summary)
    }

    async fn process_location(&self, api_key: &str, target: &RunTarget) -> LocationOutcome {
        let location_id = target.location.location_id.as_str();

        let reading = match self
            .provider
            .fetch(api_key, &target.location, self.fetch_timeout)
            .await
        {
            Ok(reading) => reading,
            Err(e) => {
                warn!(location_id = %location_id, error = %e, "Skipping location, weather unavailable");
                return LocationOutcome::Skipped {
                    reason: e.to_string(),
                };
            }
        };

        let envelope = TelemetryEnvelope::build(location_id, &reading);

        let connection = match self.registry.acquire(&target.destination).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(location_id = %location_id, error = %e, "Failed to connect to destination");
                return LocationOutcome::SendFailed {
                    reason: e.to_string(),
                };
            }
        };

        info!(
            location_id = %location_id,
            timestamp = ?envelope.timestamp,
            temp = envelope.temp.as_ref().and_then(Number::as_f64),
            humi = envelope.humi.as_ref().and_then(Number::as_f64),
            uv_index = envelope.uv_index.as_ref().and_then(Number::as_f64),
            "Sending telemetry"
        );

        match self.registry.send(connection.as_ref(), &envelope).await {
            Ok(()) => LocationOutcome::Sent,
            Err(e) => {
                error!(location_id = %location_id, error = %e, "Failed to send telemetry");
                LocationOutcome::SendFailed {
                    reason: e.to_string(),
                }
            }
        }
    }
}
