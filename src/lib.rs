//! Weather Forwarder Library
//!
//! This library collects current weather conditions for a fixed set of
//! locations and forwards each reading to a per-location IoT device:
//!
//! - **config**: Service settings and per-run credentials from the environment
//! - **location**: The static location table
//! - **weather**: Provider client and reading normalization
//! - **envelope**: Versioned telemetry envelope
//! - **registry**: Process-wide device connection cache
//! - **transport**: MQTT transport for IoT hub device connections
//! - **sas**: Shared access signature tokens for device authentication
//! - **orchestrator**: Per-run fetch, build and send pipeline
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use weather_forwarder::config::ServiceConfig;
//! use weather_forwarder::location::default_locations;
//! use weather_forwarder::orchestrator::RunOrchestrator;
//! use weather_forwarder::registry::ConnectionRegistry;
//! use weather_forwarder::transport::MqttDeviceTransport;
//! use weather_forwarder::weather::GoogleWeatherClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServiceConfig::from_env().expect("Failed to load config");
//!
//!     let provider = GoogleWeatherClient::new(config.weather_url.clone())
//!         .expect("Failed to create weather client");
//!     let transport = MqttDeviceTransport::new(config.connect_timeout, config.publish_timeout);
//!     let registry = Arc::new(ConnectionRegistry::new(Arc::new(transport)));
//!
//!     let orchestrator = RunOrchestrator::new(
//!         default_locations(),
//!         Arc::new(provider),
//!         Arc::clone(&registry),
//!         config.fetch_timeout,
//!     );
//!
//!     let outcome = orchestrator.run().await;
//!     println!("{:?}", outcome);
//!
//!     registry.shutdown().await;
//! }
//! ```

// Module declarations
pub mod config;
pub mod envelope;
pub mod location;
pub mod orchestrator;
pub mod registry;
pub mod sas;
pub mod transport;
pub mod weather;

// Re-export commonly used types at crate root for convenience
pub use config::{ConfigError, RunConfig, RunTarget, ServiceConfig};
pub use envelope::TelemetryEnvelope;
pub use location::{default_locations, Location};
pub use orchestrator::{LocationOutcome, RunOrchestrator, RunOutcome, RunSummary};
pub use registry::{
    ConnectError, ConnectionRegistry, ConnectionState, DeviceConnection, DeviceTransport,
    SendError, TelemetryMessage,
};
pub use transport::{DeviceConnectionString, MqttDeviceTransport};
pub use weather::{FetchError, FetchErrorKind, GoogleWeatherClient, WeatherProvider, WeatherReading};
