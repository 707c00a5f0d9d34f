//! Process-wide registry of device connections.
//!
//! The registry keeps at most one live connection per destination identifier.
//! The first `acquire` for an identifier connects eagerly through the
//! configured [`DeviceTransport`]; every later call returns the cached handle.
//! Concurrent callers for the same identifier wait on the first one instead of
//! opening a second connection.
//!
//! Entries are never evicted during normal operation: a failed send leaves the
//! cached connection in place. A failed connect caches nothing, so the next
//! `acquire` tries again. [`ConnectionRegistry::shutdown`] disconnects
//! everything and is meant for process termination only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::envelope::TelemetryEnvelope;

pub const CONTENT_TYPE_JSON: &str = "application/json";

pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// Errors raised while establishing a device connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("connection not acknowledged within {0:?}")]
    Timeout(Duration),

    #[error("MQTT connection error: {0}")]
    Mqtt(#[from] rumqttc::ConnectionError),

    #[error("connection failed: {0}")]
    Other(String),
}

/// Errors raised while sending telemetry over an established connection.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("destination rejected message: {0}")]
    Rejected(String),

    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),

    #[error("connection closed before acknowledgement")]
    ConnectionClosed,
}

/// Serialized telemetry body plus the content metadata the destination expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub body: String,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
}

impl TelemetryMessage {
    pub fn from_envelope(envelope: &TelemetryEnvelope) -> Result<Self, serde_json::Error> {
        Ok(Self {
            body: envelope.to_json()?,
            content_type: CONTENT_TYPE_JSON,
            content_encoding: CONTENT_ENCODING_UTF8,
        })
    }
}

/// An established connection to one destination.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    async fn publish(&self, message: &TelemetryMessage) -> Result<(), SendError>;

    async fn disconnect(&self) -> Result<(), SendError>;
}

/// Factory for destination connections.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Open a connection to `destination_id` and wait until it is usable.
    async fn connect(&self, destination_id: &str) -> Result<Arc<dyn DeviceConnection>, ConnectError>;
}

/// Lifecycle state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

type Slot = Arc<OnceCell<Arc<dyn DeviceConnection>>>;

/// Shared cache of device connections keyed by destination identifier.
pub struct ConnectionRegistry {
    transport: Arc<dyn DeviceTransport>,
    entries: Mutex<HashMap<String, Slot>>,
}

impl ConnectionRegistry {
    pub fn new(transport: Arc<dyn DeviceTransport>) -> Self {
        Self {
            transport,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the connection for `destination_id`, connecting on first use.
    pub async fn acquire(&self, destination_id: &str) -> Result<Arc<dyn DeviceConnection>, ConnectError> {
        // Map lock is released before connecting; the slot serializes per key.
        let slot = {
            let mut entries = self.entries.lock().await;
            Arc::clone(entries.entry(destination_id.to_string()).or_default())
        };

        let connection = slot
            .get_or_try_init(|| async {
                debug!("Opening device connection");
                let connection = self.transport.connect(destination_id).await?;
                info!("Device connection established");
                Ok::<_, ConnectError>(connection)
            })
            .await?;

        Ok(Arc::clone(connection))
    }

    /// Serialize `envelope` and publish it on `connection`.
    pub async fn send(
        &self,
        connection: &dyn DeviceConnection,
        envelope: &TelemetryEnvelope,
    ) -> Result<(), SendError> {
        let message = TelemetryMessage::from_envelope(envelope)?;
        connection.publish(&message).await
    }

    pub async fn state(&self, destination_id: &str) -> ConnectionState {
        let entries = self.entries.lock().await;
        match entries.get(destination_id) {
            Some(slot) if slot.initialized() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Number of live cached connections.
    pub async fn connection_count(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|slot| slot.initialized()).count()
    }

    /// Disconnect every cached connection and return how many closed cleanly.
    /// Call once at process exit.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Slot> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, slot)| slot).collect()
        };

        let mut closed = 0usize;
        for slot in drained {
            if let Some(connection) = slot.get() {
                match connection.disconnect().await {
                    Ok(()) => closed += 1,
                    Err(e) => warn!(error = %e, "Failed to disconnect device connection"),
                }
            }
        }

        info!(closed = closed, "Connection registry shut down");
        closed
    }
}
