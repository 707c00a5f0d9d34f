//! Weather Forwarder - scheduled weather to IoT hub telemetry service
//!
//! On every tick this service fetches current conditions for each configured
//! location and publishes a versioned telemetry envelope to that location's
//! IoT hub device.
//!
//! ## Configuration
//!
//! Service settings (read at startup):
//!
//! - `WEATHER_API_URL`: provider endpoint (default: Google Weather current conditions)
//! - `WEATHER_FETCH_TIMEOUT_SECS`: provider request timeout (default: 10)
//! - `WEATHER_RUN_INTERVAL_SECS`: seconds between runs (default: 900)
//! - `WEATHER_RUN_ONCE`: run once and exit (default: false)
//! - `WEATHER_CONNECT_TIMEOUT_SECS`: device connect timeout (default: 30)
//! - `WEATHER_PUBLISH_TIMEOUT_SECS`: telemetry acknowledgement timeout (default: 10)
//! - `RUST_LOG`: logging level filter (default: info)
//!
//! Run credentials (read on every run):
//!
//! - `GOOGLE_API_KEY`: provider API key
//! - `IOT_CONN_<LOCATION>`: device connection string per location
//!   (`HostName=...;DeviceId=...;SharedAccessKey=...`)

use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use weather_forwarder::config::ServiceConfig;
use weather_forwarder::location::default_locations;
use weather_forwarder::orchestrator::{RunOrchestrator, RunOutcome};
use weather_forwarder::registry::ConnectionRegistry;
use weather_forwarder::transport::MqttDeviceTransport;
use weather_forwarder::weather::GoogleWeatherClient;

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Weather Forwarder service...");

    let config = match ServiceConfig::from_env() {
        Ok(config) => {
            info!(
                weather_url = %config.weather_url,
                fetch_timeout_secs = config.fetch_timeout.as_secs(),
                run_interval_secs = config.run_interval.as_secs(),
                run_once = config.run_once,
                connect_timeout_secs = config.connect_timeout.as_secs(),
                publish_timeout_secs = config.publish_timeout.as_secs(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let provider = match GoogleWeatherClient::new(config.weather_url.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Failed to create weather client");
            std::process::exit(1);
        }
    };

    let transport = Arc::new(MqttDeviceTransport::new(
        config.connect_timeout,
        config.publish_timeout,
    ));
    let registry = Arc::new(ConnectionRegistry::new(transport));

    let orchestrator = RunOrchestrator::new(
        default_locations(),
        provider,
        Arc::clone(&registry),
        config.fetch_timeout,
    );

    if config.run_once {
        report(&orchestrator.run().await);
    } else {
        run_scheduled(&orchestrator, &config).await;
    }

    info!("Closing device connections...");
    registry.shutdown().await;

    info!("Weather Forwarder stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Run on a fixed interval until Ctrl+C. A run in progress always completes
/// before shutdown proceeds.
async fn run_scheduled(orchestrator: &RunOrchestrator, config: &ServiceConfig) {
    let mut ticker = interval(config.run_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Weather Forwarder running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                report(&orchestrator.run().await);
            }
            result = &mut shutdown => {
                match result {
                    Ok(()) => info!("Shutdown signal received, stopping..."),
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                }
                break;
            }
        }
    }
}

fn report(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(summary) if summary.failed > 0 => {
            warn!(
                run_id = %summary.run_id,
                failed = summary.failed,
                "Run completed with delivery failures"
            );
        }
        RunOutcome::Completed(_) => {}
        RunOutcome::Aborted(e) => {
            warn!(error = %e, "Run aborted, waiting for next tick");
        }
    }
}
