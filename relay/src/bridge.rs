//! Transport bridge: turns inbound broker traffic into stored records and
//! live events, and answers device resync requests.
//!
//! A single worker drains the inbound channel, so messages are handled in
//! arrival order and live events leave in that same order.

use crate::devices::{Actuator, Route, Switch, GET_STATE_FILTER, SENSOR_TOPIC, STATE_FILTER};
use crate::errors::{Error, Result};
use crate::live::{DeviceStateEvent, LiveEvent, LiveFeed};
use crate::metrics::{
    INGEST_LATENCY_SECONDS, INVALID_MESSAGES_TOTAL, RESYNC_REQUESTS_TOTAL, STATE_CHANGES_TOTAL,
    STATE_DUPLICATES_TOTAL, TELEMETRY_STORED_TOTAL,
};
use crate::model::TelemetryReading;
use crate::mqtt::{Inbound, Publisher};
use crate::store::Store;
use crate::validate::parse_sensor;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What handling one inbound item amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    Connected,
    Telemetry(TelemetryReading),
    DeviceState {
        actuator: Actuator,
        state: Switch,
        stored: bool,
    },
    Resynced {
        published: usize,
    },
    Ignored,
}

pub struct Bridge {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    live: LiveFeed,
    default_device_id: String,
}

impl Bridge {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        live: LiveFeed,
        default_device_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            publisher,
            live,
            default_device_id: default_device_id.into(),
        }
    }

    pub async fn handle(&self, inbound: Inbound) -> Result<Handled> {
        match inbound {
            Inbound::Connected => {
                self.on_connected().await?;
                Ok(Handled::Connected)
            }
            Inbound::Message {
                topic,
                payload,
                received_at,
            } => match Route::classify(&topic) {
                Route::Sensor => self
                    .on_sensor(&topic, &payload, received_at)
                    .await
                    .map(Handled::Telemetry),
                Route::DeviceState { slug } => {
                    self.on_device_state(&topic, slug, &payload, received_at)
                        .await
                }
                Route::StateRequest { device_id } => {
                    let published = self.on_state_request(device_id).await?;
                    Ok(Handled::Resynced { published })
                }
                Route::Unknown => {
                    debug!("Ignoring message on unrouted topic {}", topic);
                    Ok(Handled::Ignored)
                }
            },
        }
    }

    /// Resubscribes and clears any command left retained on the broker, so a
    /// rebooting device does not re-apply a stale command before asking for
    /// its state.
    pub async fn on_connected(&self) -> Result<()> {
        for filter in [SENSOR_TOPIC, STATE_FILTER, GET_STATE_FILTER] {
            self.publisher.subscribe(filter).await?;
            info!("Subscribed to {}", filter);
        }

        for actuator in Actuator::ALL {
            self.publisher
                .publish(&actuator.command_topic(), &[], true)
                .await?;
        }
        debug!("Cleared retained command topics");
        Ok(())
    }

    pub async fn on_sensor(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<TelemetryReading> {
        let reading = parse_sensor(topic, payload, &self.default_device_id, received_at)?;
        let stored = self.store.insert_telemetry(&reading).await?;
        TELEMETRY_STORED_TOTAL.inc();

        let sessions = self.live.emit(LiveEvent::Telemetry(stored.clone()));
        debug!(
            "Stored reading {} from {} ({} live sessions)",
            stored.id, stored.device_id, sessions
        );
        Ok(stored)
    }

    /// Appends the observed state if it differs from the latest record, then
    /// emits a state event whether or not anything was written. A failed
    /// write emits nothing, so live sessions never show a state the store
    /// does not hold.
    pub async fn on_device_state(
        &self,
        topic: &str,
        slug: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Handled> {
        let actuator = Actuator::from_slug(slug)
            .ok_or_else(|| Error::malformed(topic, format!("unknown actuator {:?}", slug)))?;
        let raw = String::from_utf8_lossy(payload);
        let state = Switch::parse(&raw)
            .ok_or_else(|| Error::malformed(topic, format!("unrecognized state {:?}", raw.trim())))?;

        let stored = match self
            .store
            .append_command_if_changed(actuator, state, received_at)
            .await?
        {
            Some(record) => {
                STATE_CHANGES_TOTAL.inc();
                info!("{} is now {} (record {})", actuator, state, record.id);
                true
            }
            None => {
                STATE_DUPLICATES_TOTAL.inc();
                debug!("{} still {}, nothing stored", actuator, state);
                false
            }
        };

        self.live.emit(LiveEvent::DeviceState(DeviceStateEvent::new(
            actuator, state, stored,
        )));

        Ok(Handled::DeviceState {
            actuator,
            state,
            stored,
        })
    }

    /// Republishes the last recorded state of every actuator, non-retained.
    /// Actuators with no history get nothing.
    pub async fn on_state_request(&self, device_id: &str) -> Result<usize> {
        RESYNC_REQUESTS_TOTAL.inc();
        info!("Device {} requested state resync", device_id);

        if !self.publisher.is_connected() {
            return Err(Error::TransportUnavailable(
                "cannot answer resync while disconnected".to_string(),
            ));
        }

        let mut published = 0;
        for actuator in Actuator::ALL {
            let Some(latest) = self.store.latest_command(actuator).await? else {
                continue;
            };
            self.publisher
                .publish(
                    &actuator.command_topic(),
                    latest.status.as_str().as_bytes(),
                    false,
                )
                .await?;
            published += 1;
        }
        Ok(published)
    }
}

/// The bridge worker: handles inbound items one at a time until the event
/// loop side of the channel is dropped.
pub async fn run_bridge(mut rx: mpsc::Receiver<Inbound>, bridge: Arc<Bridge>) {
    info!("Bridge worker started");

    while let Some(inbound) = rx.recv().await {
        let start = Instant::now();

        match bridge.handle(inbound).await {
            Ok(_) => {}
            Err(Error::Malformed { topic, reason }) => {
                INVALID_MESSAGES_TOTAL.inc();
                warn!("Dropping message on {}: {}", topic, reason);
            }
            Err(e) => {
                error!("Failed to handle inbound message: {}", e);
            }
        }

        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
    }

    info!("Bridge worker stopped");
}
