#![allow(dead_code)]

use chrono::{DateTime, Utc};
use relay::bridge::Bridge;
use relay::gateway::CommandGateway;
use relay::live::LiveFeed;
use relay::mqtt::{Inbound, MqttSettings, RecordingPublisher};
use relay::query::QueryService;
use relay::rest::AppState;
use relay::store::MemoryStore;
use serde_json::Value;
use std::sync::Arc;

pub const DEVICE_ID: &str = "esp32-001";

/// A relay wired to an in-memory store and a recording publisher.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub live: LiveFeed,
    pub bridge: Arc<Bridge>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let live = LiveFeed::new(64);
        let bridge = Arc::new(Bridge::new(
            store.clone(),
            publisher.clone(),
            live.clone(),
            DEVICE_ID,
        ));
        Self {
            store,
            publisher,
            live,
            bridge,
        }
    }

    pub fn queries(&self) -> QueryService {
        QueryService::new(self.store.clone())
    }

    pub fn gateway(&self) -> CommandGateway {
        CommandGateway::new(self.publisher.clone())
    }

    pub fn app_state(&self, token: Option<&str>) -> AppState {
        AppState::new(
            self.queries(),
            self.gateway(),
            self.live.clone(),
            token.map(str::to_string),
            // Nothing listens on the discard port; only the broker probe uses it.
            MqttSettings::new("127.0.0.1", 9, "relay-test"),
        )
    }
}

pub fn sensor(payload: Value) -> Inbound {
    Inbound::Message {
        topic: "dataSensor".to_string(),
        payload: serde_json::to_vec(&payload).unwrap(),
        received_at: Utc::now(),
    }
}

pub fn reading_at(temp: f64, at: DateTime<Utc>) -> Inbound {
    sensor(serde_json::json!({
        "deviceId": DEVICE_ID,
        "temp": temp,
        "humi": 55.0,
        "light": 420,
        "rain_mm": 0.0,
        "timestamp": at,
    }))
}

pub fn state(slug: &str, payload: &str) -> Inbound {
    Inbound::Message {
        topic: format!("device/{}/state", slug),
        payload: payload.as_bytes().to_vec(),
        received_at: Utc::now(),
    }
}

pub fn state_request(device_id: &str) -> Inbound {
    Inbound::Message {
        topic: format!("devices/{}/get_state", device_id),
        payload: Vec::new(),
        received_at: Utc::now(),
    }
}
