mod telemetry;

use anyhow::Context;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::BTreeMap;
use std::time::Duration;
use telemetry::Weather;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const ACTUATORS: [&str; 3] = ["led1", "led2", "led3"];
const REQUEST_CAPACITY: usize = 100;

/// Stands in for the sensor/actuator board: publishes readings, obeys
/// `control/<slug>` commands and reports the resulting state.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, env = "MQTT_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "DEVICE_ID", default_value = "esp32-001")]
    device_id: String,

    /// Milliseconds between sensor readings
    #[arg(long, env = "INTERVAL_MS", default_value_t = 2000)]
    interval_ms: u64,

    /// Fraction of readings sent with an implausible temperature
    #[arg(long, default_value_t = 0.0)]
    outlier_rate: f64,
}

/// Applies a command payload to the local actuator table. Returns the state
/// to report, or `None` for payloads the firmware ignores (including the
/// empty retained clears the relay sends on connect).
fn apply_command(
    states: &mut BTreeMap<&'static str, &'static str>,
    slug: &str,
    payload: &[u8],
) -> Option<&'static str> {
    let slot = states.get_mut(slug)?;
    let wanted = match std::str::from_utf8(payload).ok()?.trim() {
        s if s.eq_ignore_ascii_case("ON") => "ON",
        s if s.eq_ignore_ascii_case("OFF") => "OFF",
        _ => return None,
    };
    *slot = wanted;
    Some(wanted)
}

/// Broker traffic the device reacts to.
#[derive(Debug)]
enum Incoming {
    Connected,
    Message { topic: String, payload: Vec<u8> },
}

/// Queues a reading without waiting. A sensor has no use for readings that
/// piled up while the broker was away, so a full queue drops the reading.
fn publish_reading(client: &AsyncClient, payload: Vec<u8>) -> bool {
    client
        .try_publish("dataSensor", QoS::AtLeastOnce, false, payload)
        .is_ok()
}

/// Subscribes and asks for state on every connect, obeys commands and
/// reports the resulting state.
async fn run_device(
    client: AsyncClient,
    device_id: String,
    mut events: mpsc::UnboundedReceiver<Incoming>,
) {
    let mut states: BTreeMap<&'static str, &'static str> =
        ACTUATORS.iter().map(|slug| (*slug, "OFF")).collect();

    while let Some(incoming) = events.recv().await {
        match incoming {
            Incoming::Connected => {
                info!("Connected; subscribing and requesting state");
                let requests = async {
                    client.subscribe("control/+", QoS::AtLeastOnce).await?;
                    client
                        .subscribe("config/rain_threshold", QoS::AtLeastOnce)
                        .await?;
                    client
                        .publish(
                            format!("devices/{}/get_state", device_id),
                            QoS::AtLeastOnce,
                            false,
                            Vec::new(),
                        )
                        .await
                };
                if let Err(e) = requests.await {
                    error!("Failed to queue startup requests: {}", e);
                }
            }
            Incoming::Message { topic, payload } => {
                if topic == "config/rain_threshold" {
                    info!("Rain threshold set to {}", String::from_utf8_lossy(&payload));
                    continue;
                }

                let Some(slug) = topic.strip_prefix("control/") else {
                    debug!("Ignoring {}", topic);
                    continue;
                };
                let Some(state) = apply_command(&mut states, slug, &payload) else {
                    debug!("Ignoring command on {} ({} bytes)", topic, payload.len());
                    continue;
                };

                info!("{} -> {}", slug, state);
                let report = client
                    .publish(
                        format!("device/{}/state", slug),
                        QoS::AtLeastOnce,
                        false,
                        state,
                    )
                    .await;
                if let Err(e) = report {
                    warn!("Failed to report {} state: {}", slug, e);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, device: {}, interval: {}ms",
        args.host, args.port, args.device_id, args.interval_ms
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.host, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

    // The poll loop only forwards. Anything that waits on the request queue
    // runs elsewhere, because only this loop drains that queue.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let incoming = match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => Incoming::Connected,
                Ok(Event::Incoming(Packet::Publish(p))) => Incoming::Message {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                },
                Ok(_) => continue,
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if events_tx.send(incoming).is_err() {
                break;
            }
        }
    });

    tokio::spawn(run_device(client.clone(), args.device_id.clone(), events_rx));

    let mut weather = Weather::new(args.outlier_rate);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(10)));
    let mut counter = 0u64;
    let mut dropped = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reading = weather.next(&mut rand::thread_rng(), &args.device_id);
                let payload = serde_json::to_vec(&reading).context("failed to encode reading")?;

                if publish_reading(&client, payload) {
                    counter += 1;
                    debug!("Published reading {}: {:?}", counter, reading);
                    if counter % 100 == 0 {
                        info!("Published {} readings", counter);
                    }
                } else {
                    dropped += 1;
                    if dropped % 10 == 1 {
                        warn!("Request queue full; dropped {} readings so far", dropped);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping after {} readings ({} dropped)", counter, dropped);
                let _ = client.try_disconnect();
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> BTreeMap<&'static str, &'static str> {
        ACTUATORS.iter().map(|slug| (*slug, "OFF")).collect()
    }

    #[test]
    fn test_command_updates_state() {
        let mut states = fresh();
        assert_eq!(apply_command(&mut states, "led2", b"on"), Some("ON"));
        assert_eq!(states["led2"], "ON");
    }

    #[test]
    fn test_retained_clear_is_ignored() {
        let mut states = fresh();
        assert_eq!(apply_command(&mut states, "led1", b""), None);
        assert_eq!(apply_command(&mut states, "led9", b"ON"), None);
        assert_eq!(states["led1"], "OFF");
    }

    #[test]
    fn test_full_request_queue_drops_reading_without_waiting() {
        // Nothing polls this event loop, as while the broker is unreachable.
        let options = MqttOptions::new("sim-test", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 2);

        assert!(publish_reading(&client, b"{}".to_vec()));
        assert!(publish_reading(&client, b"{}".to_vec()));
        assert!(!publish_reading(&client, b"{}".to_vec()));
    }

    #[tokio::test]
    async fn test_device_handles_commands_until_events_end() {
        let options = MqttOptions::new("sim-test", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 10);
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(Incoming::Message {
            topic: "control/led1".to_string(),
            payload: b"ON".to_vec(),
        })
        .unwrap();
        tx.send(Incoming::Message {
            topic: "control/led1".to_string(),
            payload: Vec::new(),
        })
        .unwrap();
        drop(tx);

        tokio::time::timeout(
            Duration::from_secs(1),
            run_device(client, "esp32-001".to_string(), rx),
        )
        .await
        .expect("device task should finish once the event loop goes away");
    }
}
