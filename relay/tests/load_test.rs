//! Broker load tests. Need a broker on localhost:1883 and a running relay;
//! run with `cargo test -p relay --test load_test -- --ignored`.

use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::time::sleep;

fn random_reading(device_id: &str) -> String {
    let mut rng = rand::thread_rng();
    json!({
        "deviceId": device_id,
        "temp": rng.gen_range(15.0..35.0),
        "humi": rng.gen_range(30.0..80.0),
        "light": rng.gen_range(0..2000),
        "rain_mm": rng.gen_range(0.0..5.0),
    })
    .to_string()
}

async fn connected_client(client_id: &str) -> AsyncClient {
    let mut mqtt_options = MqttOptions::new(client_id, "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;
    client
}

#[tokio::test]
#[ignore]
async fn test_sensor_burst_throughput() {
    let target_rate: usize = 200;
    let duration_secs: usize = 10;
    let total = target_rate * duration_secs;

    let client = connected_client("relay-load-test").await;

    let burst_size: usize = 20;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000 / target_rate) as u64);

    let start = Instant::now();
    let mut sent = 0;
    let mut errors = 0;

    for batch_start in (0..total).step_by(burst_size) {
        for i in batch_start..std::cmp::min(batch_start + burst_size, total) {
            let device_id = format!("load-dev-{}", i % 5);
            match client
                .publish("dataSensor", QoS::AtLeastOnce, false, random_reading(&device_id))
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => {
                    errors += 1;
                    if errors < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }
        sleep(delay_per_burst).await;
    }

    let elapsed = start.elapsed().as_secs_f64();
    let rate = sent as f64 / elapsed;
    println!("Sent {} readings in {:.2}s ({:.0} msg/s), {} errors", sent, elapsed, rate, errors);

    assert_eq!(errors, 0);
    assert!(rate >= target_rate as f64 * 0.9, "throughput too low: {:.0} msg/s", rate);
}

#[tokio::test]
#[ignore]
async fn test_resync_round_trip() {
    let mut mqtt_options = MqttOptions::new("relay-resync-test", "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    client.subscribe("control/led1", QoS::AtLeastOnce).await.unwrap();
    client
        .publish("device/led1/state", QoS::AtLeastOnce, false, "ON")
        .await
        .unwrap();

    // Give the relay time to record the state before asking for it back.
    let requested_at = Instant::now() + Duration::from_secs(1);
    let mut requested = false;

    let reply = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if !requested && Instant::now() >= requested_at {
                client
                    .publish("devices/load-dev/get_state", QoS::AtLeastOnce, false, "")
                    .await
                    .unwrap();
                requested = true;
            }
            match tokio::time::timeout(Duration::from_millis(200), eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::Publish(p)))) if requested && !p.payload.is_empty() => {
                    return (p.retain, String::from_utf8_lossy(&p.payload).to_string());
                }
                Ok(Err(e)) => panic!("MQTT error: {}", e),
                _ => {}
            }
        }
    })
    .await
    .expect("no resync reply");

    assert_eq!(reply, (false, "ON".to_string()));
}
