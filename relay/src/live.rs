//! Live fan-out of telemetry and device-state events to dashboard sessions.
//!
//! One bounded broadcast channel; each session holds a receiver. Events are
//! delivered to a session in emission order. A session that falls more than
//! the channel capacity behind loses the oldest events and keeps going; the
//! dashboard reconciles by re-querying history.

use crate::devices::{Actuator, Switch};
use crate::metrics::LIVE_SESSIONS;
use crate::model::TelemetryReading;
use axum::response::sse::Event;
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStateEvent {
    pub device: String,
    pub slug: String,
    pub state: Switch,
    /// Whether this observation appended a new history record.
    pub stored: bool,
}

impl DeviceStateEvent {
    pub fn new(actuator: Actuator, state: Switch, stored: bool) -> Self {
        Self {
            device: actuator.display_name().to_string(),
            slug: actuator.slug().to_string(),
            state,
            stored,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LiveEvent {
    Telemetry(TelemetryReading),
    DeviceState(DeviceStateEvent),
}

impl LiveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::Telemetry(_) => "telemetry",
            LiveEvent::DeviceState(_) => "device_state",
        }
    }

    pub fn to_sse(&self) -> Result<Event, Infallible> {
        let data = match self {
            LiveEvent::Telemetry(reading) => serde_json::to_string(reading),
            LiveEvent::DeviceState(state) => serde_json::to_string(state),
        }
        .unwrap_or_default();

        Ok(Event::default().event(self.name()).data(data))
    }
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct LiveFeed {
    tx: broadcast::Sender<LiveEvent>,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Delivers `event` to every current session and returns how many there
    /// were. Never blocks and never fails; zero sessions is not an error.
    pub fn emit(&self, event: LiveEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!("No live sessions; event dropped");
                0
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        LIVE_SESSIONS.inc();
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One session's registration. Dropping it unregisters the session.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<LiveEvent>,
}

impl Subscription {
    /// Next event, skipping over any the session was too slow to receive.
    /// `None` once the feed itself is gone.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Live session lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        LIVE_SESSIONS.dec();
    }
}
