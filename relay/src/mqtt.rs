//! Broker connection: the event loop that feeds the bridge, and the publish
//! handle shared by the bridge and the command gateway.

use crate::devices::Route;
use crate::errors::{Error, Result};
use crate::metrics::{CHANNEL_FULL_TOTAL, MESSAGES_TOTAL};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub credentials: Option<(String, String)>,
    /// Depth of the client's outgoing request queue.
    pub capacity: usize,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(30),
            credentials: None,
            capacity: 256,
        }
    }

    pub fn url(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }

    fn options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user, password);
        }
        options
    }
}

/// What the event loop hands to the bridge worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The broker accepted a (re)connection.
    Connected,
    Message {
        topic: String,
        payload: Vec<u8>,
        received_at: DateTime<Utc>,
    },
}

/// Outbound side of the broker connection.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

    async fn subscribe(&self, filter: &str) -> Result<()>;

    /// Asks the broker connection to close. Does not wait for the broker.
    async fn disconnect(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttPublisher {
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::TransportUnavailable("broker not connected".to_string()))
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.ensure_connected()?;
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        self.ensure_connected()?;
        self.client.subscribe(filter, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Never waits on the request queue, which may be full while offline.
        self.client.try_disconnect()?;
        Ok(())
    }
}

/// Creates the long-lived client. Nothing happens on the wire until the
/// returned event loop is driven by [`run_mqtt`].
pub fn connect(settings: &MqttSettings) -> (MqttPublisher, EventLoop) {
    info!("Connecting to MQTT broker at {}:{}", settings.host, settings.port);

    let (client, eventloop) =
        AsyncClient::new(settings.options(&settings.client_id), settings.capacity);
    let publisher = MqttPublisher {
        client,
        connected: Arc::new(AtomicBool::new(false)),
    };
    (publisher, eventloop)
}

fn route_label(topic: &str) -> &'static str {
    match Route::classify(topic) {
        Route::Sensor => "sensor",
        Route::DeviceState { .. } => "state",
        Route::StateRequest { .. } => "get_state",
        Route::Unknown => "unknown",
    }
}

async fn forward(tx: &mpsc::Sender<Inbound>, inbound: Inbound) -> Result<()> {
    match tx.try_send(inbound) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(inbound)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Inbound channel full, using blocking send");
            tx.send(inbound).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ChannelSend),
    }
}

/// Drives the event loop, forwarding connections and publishes to the
/// bridge. Reconnection is left to rumqttc; this loop only backs off between
/// failed polls. Returns once our own disconnect has been sent, or when the
/// bridge side has gone away.
pub async fn run_mqtt(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    tx: mpsc::Sender<Inbound>,
) -> Result<()> {
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker ({:?})", ack.code);
                connected.store(true, Ordering::SeqCst);
                backoff_ms = INITIAL_BACKOFF_MS;
                forward(&tx, Inbound::Connected).await?;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL
                    .with_label_values(&[route_label(&publish.topic)])
                    .inc();

                debug!(
                    "Received message on topic {}, size: {} bytes, retained: {}",
                    publish.topic,
                    publish.payload.len(),
                    publish.retain
                );

                let inbound = Inbound::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    received_at: Utc::now(),
                };
                forward(&tx, inbound).await?;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnected from MQTT broker");
                connected.store(false, Ordering::SeqCst);
                return Ok(());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker sent disconnect");
                connected.store(false, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    warn!("Lost connection to MQTT broker: {}", e);
                } else {
                    error!("MQTT error: {}. Retrying in {}ms", e, backoff_ms);
                }
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Opens a throwaway connection to check the broker is reachable, without
/// touching the long-lived client.
pub async fn probe(settings: &MqttSettings, timeout: Duration) -> Result<()> {
    let client_id = format!("{}-probe-{}", settings.client_id, uuid::Uuid::new_v4());
    let (client, mut eventloop) = AsyncClient::new(settings.options(&client_id), 10);

    let attempt = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(Error::TransportUnavailable(e.to_string())),
            }
        }
    };

    let outcome = match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(Error::TransportUnavailable(format!(
            "no answer from {} within {:?}",
            settings.url(),
            timeout
        ))),
    };

    if outcome.is_ok() {
        let _ = client.try_disconnect();
    }
    outcome
}

/// A message handed to a [`RecordingPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Published {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("")
    }
}

/// In-process publisher that records instead of sending. Used by tests and
/// by anything that wants to run the bridge without a broker.
#[derive(Debug)]
pub struct RecordingPublisher {
    connected: AtomicBool,
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Returns and forgets everything published so far.
    pub fn take(&self) -> Vec<Published> {
        self.published
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::TransportUnavailable("broker not connected".to_string()));
        }
        if let Ok(mut published) = self.published.lock() {
            published.push(Published {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retain,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::TransportUnavailable("broker not connected".to_string()));
        }
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.set_connected(false);
        Ok(())
    }
}
