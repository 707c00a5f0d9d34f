//! MQTT device transport for IoT hub destinations.
//!
//! A destination identifier is a device connection string of the form
//!
//! ```text
//! HostName=<hub>.azure-devices.net;DeviceId=<device>;SharedAccessKey=<base64 key>
//! ```
//!
//! The key never leaves the process: each connection signs short-lived SAS
//! tokens from it and renews the token before expiry. Optional `Port=<u16>`
//! (default 8883) and `Transport=tcp|tls` (default `tls`) keys allow pointing
//! a device at a plain local broker, in which case the key may be omitted.
//!
//! Each connection owns an `AsyncClient` whose event loop is driven by a
//! spawned task for as long as the connection lives. A publish only succeeds
//! once the broker has acknowledged it (QoS 1 PUBACK).

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::{ConnectError, DeviceConnection, DeviceTransport, SendError, TelemetryMessage};
use crate::sas::{needs_refresh, SasSigner};

const DEFAULT_MQTT_TLS_PORT: u16 = 8883;

/// IoT hub MQTT API version sent in the username.
const IOT_HUB_API_VERSION: &str = "2021-04-12";

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Request channel capacity for each device client.
const CLIENT_CAPACITY: usize = 16;

/// How long `disconnect` waits for the event loop to flush.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Pause between reconnect attempts after an event loop error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Parsed device connection string.
#[derive(Clone)]
pub struct DeviceConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub port: u16,
    pub tls: bool,
    signer: Option<SasSigner>,
}

impl FromStr for DeviceConnectionString {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;
        let mut port = None;
        let mut tls = true;

        for segment in s.split(';').map(str::trim).filter(|seg| !seg.is_empty()) {
            // Values (base64 keys in particular) may contain '='
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                ConnectError::InvalidConnectionString("segment without '='".to_string())
            })?;

            match key {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.to_string()),
                "SharedAccessSignature" => {
                    return Err(ConnectError::InvalidConnectionString(
                        "pre-generated SharedAccessSignature tokens expire; use SharedAccessKey".to_string(),
                    ))
                }
                "Port" => {
                    port = Some(value.parse::<u16>().map_err(|_| {
                        ConnectError::InvalidConnectionString(format!("'{}' is not a valid port", value))
                    })?)
                }
                "Transport" => {
                    tls = match value.to_ascii_lowercase().as_str() {
                        "tls" | "mqtts" => true,
                        "tcp" | "mqtt" => false,
                        other => {
                            return Err(ConnectError::InvalidConnectionString(format!(
                                "unsupported transport '{}'",
                                other
                            )))
                        }
                    }
                }
                _ => {}
            }
        }

        let host_name = host_name
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConnectError::InvalidConnectionString("missing HostName".to_string()))?;
        let device_id = device_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConnectError::InvalidConnectionString("missing DeviceId".to_string()))?;

        let signer = shared_access_key
            .map(|key| SasSigner::new(&host_name, &device_id, &key))
            .transpose()?;

        Ok(Self {
            host_name,
            device_id,
            port: port.unwrap_or(DEFAULT_MQTT_TLS_PORT),
            tls,
            signer,
        })
    }
}

impl std::fmt::Debug for DeviceConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("shared_access_key", &self.signer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl DeviceConnectionString {
    /// MQTT username expected by the hub for this device.
    pub fn username(&self) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.host_name, self.device_id, IOT_HUB_API_VERSION
        )
    }

    pub fn has_key(&self) -> bool {
        self.signer.is_some()
    }

    /// Device-to-cloud topic with the message's content properties attached.
    pub fn telemetry_topic(&self, message: &TelemetryMessage) -> String {
        format!(
            "devices/{}/messages/events/$.ct={}&$.ce={}",
            self.device_id,
            urlencoding::encode(message.content_type),
            urlencoding::encode(message.content_encoding)
        )
    }

    /// Client options plus, for key-based devices, the token renewal state.
    fn mqtt_options(&self) -> (MqttOptions, Option<TokenRenewal>) {
        let mut options = MqttOptions::new(&self.device_id, &self.host_name, self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        let renewal = self.signer.as_ref().map(|signer| {
            let (token, expiry) = signer.token();
            options.set_credentials(self.username(), token);
            TokenRenewal {
                signer: signer.clone(),
                username: self.username(),
                expiry,
            }
        });

        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        (options, renewal)
    }
}

/// Keeps the SAS token in the client options fresh. The hub closes the
/// session when the previous token expires; the reconnect that follows
/// authenticates with the renewed one.
struct TokenRenewal {
    signer: SasSigner,
    username: String,
    expiry: i64,
}

impl TokenRenewal {
    fn renew_if_due(&mut self, options: &mut MqttOptions, now: i64) -> bool {
        if !needs_refresh(self.expiry, now) {
            return false;
        }

        let (token, expiry) = self.signer.token();
        options.set_credentials(self.username.clone(), token);
        self.expiry = expiry;
        true
    }
}

/// Matches broker PUBACKs to the publish currently awaiting one.
///
/// Publishes on a connection are serialized, so at most one waiter exists.
/// Packet ids of publishes that were abandoned after a timeout are tracked as
/// stale so a late retransmission or acknowledgement never resolves a newer
/// waiter.
#[derive(Default)]
struct AckTracker {
    slot: std::sync::Mutex<AckSlot>,
}

#[derive(Default)]
struct AckSlot {
    waiter: Option<oneshot::Sender<()>>,
    pkid: Option<u16>,
    /// Abandoned publishes not yet written to the network
    unsent_stale: usize,
    stale_pkids: HashSet<u16>,
}

impl AckTracker {
    fn lock(&self) -> std::sync::MutexGuard<'_, AckSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm(&self, waiter: oneshot::Sender<()>) {
        let mut slot = self.lock();
        slot.waiter = Some(waiter);
        slot.pkid = None;
    }

    /// Drop the waiter for a publish that never reached the request queue.
    fn cancel(&self) {
        let mut slot = self.lock();
        slot.waiter = None;
        slot.pkid = None;
    }

    /// Drop the waiter for a queued publish that was never acknowledged.
    fn abandon(&self) {
        let mut slot = self.lock();
        slot.waiter = None;
        match slot.pkid.take() {
            Some(pkid) => {
                slot.stale_pkids.insert(pkid);
            }
            None => slot.unsent_stale += 1,
        }
    }

    fn published(&self, pkid: u16) {
        let mut slot = self.lock();
        if slot.stale_pkids.contains(&pkid) {
            return;
        }
        if slot.unsent_stale > 0 {
            slot.unsent_stale -= 1;
            slot.stale_pkids.insert(pkid);
            return;
        }
        if slot.waiter.is_some() && slot.pkid.is_none() {
            slot.pkid = Some(pkid);
        }
    }

    fn acknowledged(&self, pkid: u16) -> bool {
        let mut slot = self.lock();
        slot.stale_pkids.remove(&pkid);
        if slot.pkid != Some(pkid) {
            return false;
        }
        slot.pkid = None;
        match slot.waiter.take() {
            Some(waiter) => waiter.send(()).is_ok(),
            None => false,
        }
    }

    /// Wake any waiter with a closed-channel error.
    fn close(&self) {
        let mut slot = self.lock();
        slot.waiter = None;
        slot.pkid = None;
    }
}

/// Opens MQTT connections to IoT hub devices.
pub struct MqttDeviceTransport {
    connect_timeout: Duration,
    publish_timeout: Duration,
}

impl MqttDeviceTransport {
    pub fn new(connect_timeout: Duration, publish_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            publish_timeout,
        }
    }
}

#[async_trait]
impl DeviceTransport for MqttDeviceTransport {
    async fn connect(&self, destination_id: &str) -> Result<Arc<dyn DeviceConnection>, ConnectError> {
        let target: DeviceConnectionString = destination_id.parse()?;

        debug!(
            device_id = %target.device_id,
            host = %target.host_name,
            port = target.port,
            tls = target.tls,
            authenticated = target.has_key(),
            "Connecting to IoT hub"
        );

        let (options, renewal) = target.mqtt_options();
        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);

        tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| ConnectError::Timeout(self.connect_timeout))??;

        info!(device_id = %target.device_id, "Connected to IoT hub");

        let acks = Arc::new(AckTracker::default());
        let driver = tokio::spawn(drive_eventloop(
            eventloop,
            target.device_id.clone(),
            Arc::clone(&acks),
            renewal,
        ));

        Ok(Arc::new(MqttDeviceConnection {
            client,
            target,
            publish_timeout: self.publish_timeout,
            acks,
            in_flight: Mutex::new(()),
            driver: Mutex::new(Some(driver)),
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// Poll the event loop until the client disconnects. rumqttc reconnects on
/// the next poll after an error, so errors are logged and polling continues.
async fn drive_eventloop(
    mut eventloop: EventLoop,
    device_id: String,
    acks: Arc<AckTracker>,
    mut renewal: Option<TokenRenewal>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(device_id = %device_id, "MQTT event loop stopping");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.published(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                if acks.acknowledged(ack.pkid) {
                    debug!(device_id = %device_id, pkid = ack.pkid, "Telemetry acknowledged");
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(device_id = %device_id, error = %e, "MQTT event loop error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }

        if let Some(renewal) = renewal.as_mut() {
            if renewal.renew_if_due(&mut eventloop.mqtt_options, Utc::now().timestamp()) {
                info!(device_id = %device_id, "SAS token renewed");
            }
        }
    }

    acks.close();
}

/// A live MQTT connection for one device.
pub struct MqttDeviceConnection {
    client: AsyncClient,
    target: DeviceConnectionString,
    publish_timeout: Duration,
    acks: Arc<AckTracker>,
    in_flight: Mutex<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl DeviceConnection for MqttDeviceConnection {
    async fn publish(&self, message: &TelemetryMessage) -> Result<(), SendError> {
        let topic = self.target.telemetry_topic(message);
        let _in_flight = self.in_flight.lock().await;

        let (waiter, acked) = oneshot::channel();
        self.acks.arm(waiter);

        // Never wait on a full request queue: a dead broker fills it
        if let Err(e) = self.client.try_publish(
            topic,
            QoS::AtLeastOnce,
            false,
            message.body.clone().into_bytes(),
        ) {
            self.acks.cancel();
            return Err(e.into());
        }

        match tokio::time::timeout(self.publish_timeout, acked).await {
            Ok(Ok(())) => {
                debug!(
                    device_id = %self.target.device_id,
                    size_bytes = message.body.len(),
                    "Telemetry delivered"
                );
                Ok(())
            }
            Ok(Err(_)) => Err(SendError::ConnectionClosed),
            Err(_) => {
                self.acks.abandon();
                Err(SendError::AckTimeout(self.publish_timeout))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), SendError> {
        let result = self.client.try_disconnect();

        if let Some(mut driver) = self.driver.lock().await.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                warn!(device_id = %self.target.device_id, "Event loop did not stop in time, aborting");
                driver.abort();
            }
        }

        result.map_err(SendError::from)
    }
}
