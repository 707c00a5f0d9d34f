use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use weather_forwarder::orchestrator::ConfigSource;
use weather_forwarder::{
    default_locations, ConnectError, ConnectionRegistry, ConnectionState, DeviceConnection,
    DeviceTransport, FetchError, FetchErrorKind, Location, LocationOutcome, RunOrchestrator,
    SendError, TelemetryMessage, WeatherProvider, WeatherReading,
};

const BANGKOK_CONN: &str = "HostName=hub;DeviceId=bangkok;SharedAccessKey=a2V5LWJraw==";
const AYUTTHAYA_CONN: &str = "HostName=hub;DeviceId=ayutthaya;SharedAccessKey=a2V5LWF5dA==";

/// Provider that answers from a per-location script and records every call.
#[derive(Default)]
struct ScriptedProvider {
    readings: HashMap<String, WeatherReading>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedProvider {
    fn with_reading(mut self, location_id: &str, reading: WeatherReading) -> Self {
        self.readings.insert(location_id.to_string(), reading);
        self
    }

    fn fetch_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl WeatherProvider for ScriptedProvider {
    async fn fetch(
        &self,
        api_key: &str,
        location: &Location,
        _timeout: Duration,
    ) -> Result<WeatherReading, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((api_key.to_string(), location.location_id.clone()));

        self.readings
            .get(&location.location_id)
            .cloned()
            .ok_or_else(|| FetchError::new(location.location_id.clone(), FetchErrorKind::Timeout))
    }
}

/// Published messages keyed by destination identifier.
type Outbox = Arc<Mutex<Vec<(String, TelemetryMessage)>>>;

struct RecordingConnection {
    destination_id: String,
    outbox: Outbox,
    reject: bool,
}

#[async_trait]
impl DeviceConnection for RecordingConnection {
    async fn publish(&self, message: &TelemetryMessage) -> Result<(), SendError> {
        if self.reject {
            return Err(SendError::Rejected("quota exceeded".to_string()));
        }
        self.outbox
            .lock()
            .unwrap()
            .push((self.destination_id.clone(), message.clone()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SendError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingTransport {
    connects: Mutex<Vec<String>>,
    outbox: Outbox,
    reject_destinations: Vec<String>,
    unreachable_destinations: Vec<String>,
}

impl RecordingTransport {
    fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    fn sent(&self) -> Vec<(String, Value)> {
        self.outbox
            .lock()
            .unwrap()
            .iter()
            .map(|(dest, msg)| (dest.clone(), serde_json::from_str(&msg.body).unwrap()))
            .collect()
    }
}

#[async_trait]
impl DeviceTransport for RecordingTransport {
    async fn connect(&self, destination_id: &str) -> Result<Arc<dyn DeviceConnection>, ConnectError> {
        self.connects.lock().unwrap().push(destination_id.to_string());

        if self.unreachable_destinations.iter().any(|d| d == destination_id) {
            return Err(ConnectError::Other("host unreachable".to_string()));
        }

        Ok(Arc::new(RecordingConnection {
            destination_id: destination_id.to_string(),
            outbox: Arc::clone(&self.outbox),
            reject: self.reject_destinations.iter().any(|d| d == destination_id),
        }))
    }
}

fn full_config() -> ConfigSource {
    config_from(&[
        ("GOOGLE_API_KEY", "test-key"),
        ("IOT_CONN_BANGKOK", BANGKOK_CONN),
        ("IOT_CONN_AYUTTHAYA", AYUTTHAYA_CONN),
    ])
}

fn config_from(pairs: &[(&str, &str)]) -> ConfigSource {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Arc::new(move |name| map.get(name).cloned())
}

fn bangkok_reading() -> WeatherReading {
    WeatherReading::from_json(
        r#"{"currentTime":"T1","temperature":{"degrees":30.2},"relativeHumidity":70,"uvIndex":5}"#,
    )
    .unwrap()
}

fn ayutthaya_reading() -> WeatherReading {
    WeatherReading::from_json(r#"{"currentTime":"T2","temperature":{"degrees":29.0},"relativeHumidity":64}"#)
        .unwrap()
}

fn orchestrator(
    provider: Arc<ScriptedProvider>,
    transport: Arc<RecordingTransport>,
    config: ConfigSource,
) -> RunOrchestrator {
    let registry = Arc::new(ConnectionRegistry::new(transport));
    RunOrchestrator::new(default_locations(), provider, registry, Duration::from_secs(10))
        .with_config_source(config)
}

#[tokio::test]
async fn test_complete_run_sends_each_location_to_its_destination() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .with_reading("bangkok", bangkok_reading())
            .with_reading("ayutthaya", ayutthaya_reading()),
    );
    let transport = Arc::new(RecordingTransport::default());
    let orchestrator = orchestrator(provider.clone(), transport.clone(), full_config());

    let outcome = orchestrator.run().await;
    let summary = outcome.summary().expect("run should complete");

    assert_eq!(summary.sent, 2);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.failed, 0);

    // Configuration order, one fetch each, with the configured key
    let calls = provider.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            ("test-key".to_string(), "bangkok".to_string()),
            ("test-key".to_string(), "ayutthaya".to_string()),
        ]
    );

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, BANGKOK_CONN);
    assert_eq!(sent[0].1["locationId"], "bangkok");
    assert_eq!(sent[1].0, AYUTTHAYA_CONN);
    assert_eq!(sent[1].1["locationId"], "ayutthaya");
}

#[tokio::test]
async fn test_missing_configuration_makes_no_network_calls() {
    let provider = Arc::new(ScriptedProvider::default().with_reading("bangkok", bangkok_reading()));
    let transport = Arc::new(RecordingTransport::default());
    let config = config_from(&[
        ("GOOGLE_API_KEY", "test-key"),
        ("IOT_CONN_BANGKOK", BANGKOK_CONN),
    ]);
    let orchestrator = orchestrator(provider.clone(), transport.clone(), config);

    let outcome = orchestrator.run().await;

    assert!(outcome.is_aborted());
    assert_eq!(provider.fetch_count(), 0);
    assert_eq!(transport.connect_count(), 0);
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_missing_api_key_aborts_run() {
    let provider = Arc::new(ScriptedProvider::default());
    let transport = Arc::new(RecordingTransport::default());
    let config = config_from(&[
        ("IOT_CONN_BANGKOK", BANGKOK_CONN),
        ("IOT_CONN_AYUTTHAYA", AYUTTHAYA_CONN),
    ]);
    let orchestrator = orchestrator(provider.clone(), transport.clone(), config);

    let outcome = orchestrator.run().await;

    assert!(outcome.is_aborted());
    assert_eq!(provider.fetch_count(), 0);
    assert_eq!(transport.connect_count(), 0);
}

#[tokio::test]
async fn test_fetch_failure_skips_location_and_continues() {
    // Bangkok succeeds, Ayutthaya times out
    let provider = Arc::new(ScriptedProvider::default().with_reading("bangkok", bangkok_reading()));
    let transport = Arc::new(RecordingTransport::default());
    let orchestrator = orchestrator(provider.clone(), transport.clone(), full_config());

    let outcome = orchestrator.run().await;
    let summary = outcome.summary().expect("run should complete");

    assert_eq!(summary.sent, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);
    assert!(matches!(
        summary.outcome_for("ayutthaya"),
        Some(LocationOutcome::Skipped { .. })
    ));

    assert_eq!(provider.fetch_count(), 2);
    assert_eq!(transport.connects.lock().unwrap().clone(), vec![BANGKOK_CONN.to_string()]);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].1,
        serde_json::json!({
            "schemaVersion": "v1",
            "source": "google-weather",
            "locationId": "bangkok",
            "timestamp": "T1",
            "temp": 30.2,
            "humi": 70,
            "uv_index": 5
        })
    );
}

#[tokio::test]
async fn test_first_location_failure_does_not_block_second() {
    let provider = Arc::new(ScriptedProvider::default().with_reading("ayutthaya", ayutthaya_reading()));
    let transport = Arc::new(RecordingTransport::default());
    let orchestrator = orchestrator(provider.clone(), transport.clone(), full_config());

    let summary = orchestrator.run().await.summary().cloned().unwrap();

    assert_eq!(summary.sent, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.outcome_for("ayutthaya"), Some(&LocationOutcome::Sent));
}

#[tokio::test]
async fn test_missing_uv_index_is_sent_as_null() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .with_reading("bangkok", bangkok_reading())
            .with_reading("ayutthaya", ayutthaya_reading()),
    );
    let transport = Arc::new(RecordingTransport::default());
    let orchestrator = orchestrator(provider, transport.clone(), full_config());

    orchestrator.run().await;

    let sent = transport.sent();
    let ayutthaya = &sent
        .iter()
        .find(|(dest, _)| dest == AYUTTHAYA_CONN)
        .expect("ayutthaya should be sent")
        .1;
    assert!(ayutthaya.get("uv_index").is_some());
    assert!(ayutthaya["uv_index"].is_null());
}

#[tokio::test]
async fn test_connections_are_reused_across_runs() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .with_reading("bangkok", bangkok_reading())
            .with_reading("ayutthaya", ayutthaya_reading()),
    );
    let transport = Arc::new(RecordingTransport::default());
    let orchestrator = orchestrator(provider.clone(), transport.clone(), full_config());

    orchestrator.run().await;
    orchestrator.run().await;
    orchestrator.run().await;

    assert_eq!(provider.fetch_count(), 6);
    assert_eq!(transport.sent().len(), 6);
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(orchestrator.registry().connection_count().await, 2);
}

#[tokio::test]
async fn test_send_failure_is_isolated_and_keeps_connection() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .with_reading("bangkok", bangkok_reading())
            .with_reading("ayutthaya", ayutthaya_reading()),
    );
    let transport = Arc::new(RecordingTransport {
        reject_destinations: vec![BANGKOK_CONN.to_string()],
        ..Default::default()
    });
    let orchestrator = orchestrator(provider, transport.clone(), full_config());

    let summary = orchestrator.run().await.summary().cloned().unwrap();

    assert_eq!(summary.sent, 1);
    assert_eq!(summary.failed, 1);
    assert!(matches!(
        summary.outcome_for("bangkok"),
        Some(LocationOutcome::SendFailed { .. })
    ));
    assert_eq!(summary.outcome_for("ayutthaya"), Some(&LocationOutcome::Sent));

    assert_eq!(
        orchestrator.registry().state(BANGKOK_CONN).await,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_unreachable_destination_is_retried_next_run() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .with_reading("bangkok", bangkok_reading())
            .with_reading("ayutthaya", ayutthaya_reading()),
    );
    let transport = Arc::new(RecordingTransport {
        unreachable_destinations: vec![AYUTTHAYA_CONN.to_string()],
        ..Default::default()
    });
    let orchestrator = orchestrator(provider, transport.clone(), full_config());

    let first = orchestrator.run().await.summary().cloned().unwrap();
    assert_eq!(first.sent, 1);
    assert_eq!(first.failed, 1);

    let second = orchestrator.run().await.summary().cloned().unwrap();
    assert_eq!(second.failed, 1);

    // Bangkok connected once; Ayutthaya attempted on each run
    let connects = transport.connects.lock().unwrap().clone();
    assert_eq!(connects.iter().filter(|d| *d == BANGKOK_CONN).count(), 1);
    assert_eq!(connects.iter().filter(|d| *d == AYUTTHAYA_CONN).count(), 2);
}

#[tokio::test]
async fn test_configuration_is_read_on_every_run() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .with_reading("bangkok", bangkok_reading())
            .with_reading("ayutthaya", ayutthaya_reading()),
    );
    let transport = Arc::new(RecordingTransport::default());

    let reads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reads);
    let base = full_config();
    let config: ConfigSource = Arc::new(move |name| {
        // Credentials only appear after the first run
        if name == "GOOGLE_API_KEY" && counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return None;
        }
        base(name)
    });

    let orchestrator = orchestrator(provider.clone(), transport, config);

    assert!(orchestrator.run().await.is_aborted());
    assert_eq!(provider.fetch_count(), 0);

    let summary = orchestrator.run().await.summary().cloned().unwrap();
    assert_eq!(summary.sent, 2);
    assert_eq!(reads.load(Ordering::SeqCst), 2);
}
