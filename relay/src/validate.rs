use crate::errors::{Error, Result};
use crate::model::{NewReading, SensorField, SensorPayload};
use chrono::{DateTime, Utc};

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;
const LIGHT_MIN: f64 = 0.0;
const LIGHT_MAX: f64 = 200_000.0;
const RAIN_MIN: f64 = 0.0;
const RAIN_MAX: f64 = 1_000.0;

fn required(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<f64> {
    let value = value.ok_or_else(|| Error::Validation(format!("{} is required", name)))?;

    if !value.is_finite() {
        return Err(Error::Validation(format!("{} must be finite", name)));
    }

    if value < min || value > max {
        return Err(Error::Validation(format!(
            "{} {} out of range [{}, {}]",
            name, value, min, max
        )));
    }

    Ok(value)
}

/// Validates a sensor payload and turns it into a storable reading.
///
/// Values are quantized to display precision here, once, so that stored rows
/// and search comparisons agree. The capture time comes from the payload when
/// the device sent one, otherwise from `received_at`.
pub fn validate(
    payload: SensorPayload,
    default_device_id: &str,
    received_at: DateTime<Utc>,
) -> Result<NewReading> {
    let temperature = required("temp", payload.temp, TEMP_MIN, TEMP_MAX)?;
    let humidity = required("humi", payload.humi, HUMIDITY_MIN, HUMIDITY_MAX)?;
    let light = required("light", payload.light, LIGHT_MIN, LIGHT_MAX)?;
    let rainfall = required("rain_mm", payload.rain_mm, RAIN_MIN, RAIN_MAX)?;

    let device_id = match payload.device_id {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        Some(_) => return Err(Error::Validation("Device ID cannot be empty".to_string())),
        None => default_device_id.to_string(),
    };

    Ok(NewReading {
        device_id,
        temperature: SensorField::Temperature.quantize(temperature),
        humidity: SensorField::Humidity.quantize(humidity),
        light: SensorField::Light.scaled(light),
        rainfall: SensorField::Rainfall.quantize(rainfall),
        captured_at: payload.timestamp.unwrap_or(received_at),
    })
}

/// Parses and validates a raw `dataSensor` message body.
pub fn parse_sensor(
    topic: &str,
    payload: &[u8],
    default_device_id: &str,
    received_at: DateTime<Utc>,
) -> Result<NewReading> {
    let parsed = serde_json::from_slice::<SensorPayload>(payload)
        .map_err(|e| Error::malformed(topic, format!("JSON parse error: {}", e)))?;

    validate(parsed, default_device_id, received_at).map_err(|e| match e {
        Error::Validation(reason) => Error::malformed(topic, reason),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload() -> SensorPayload {
        SensorPayload {
            device_id: Some("dev-1".to_string()),
            temp: Some(25.04),
            humi: Some(60.0),
            light: Some(812.7),
            rain_mm: Some(0.125),
            timestamp: None,
        }
    }

    #[test]
    fn test_valid_telemetry() {
        let now = Utc::now();
        let reading = validate(payload(), "esp32-001", now).unwrap();

        assert_eq!(reading.device_id, "dev-1");
        assert_eq!(reading.temperature, 25.0);
        assert_eq!(reading.light, 812);
        assert_eq!(reading.rainfall, 0.13);
        assert_eq!(reading.captured_at, now);
    }

    #[test]
    fn test_default_device_id() {
        let mut p = payload();
        p.device_id = None;

        let reading = validate(p, "esp32-001", Utc::now()).unwrap();
        assert_eq!(reading.device_id, "esp32-001");
    }

    #[test]
    fn test_device_timestamp_wins() {
        let captured = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let mut p = payload();
        p.timestamp = Some(captured);

        let reading = validate(p, "esp32-001", Utc::now()).unwrap();
        assert_eq!(reading.captured_at, captured);
    }

    #[test]
    fn test_missing_field() {
        let mut p = payload();
        p.rain_mm = None;

        match validate(p, "esp32-001", Utc::now()) {
            Err(Error::Validation(msg)) => assert!(msg.contains("rain_mm")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_field() {
        let mut p = payload();
        p.humi = Some(f64::NAN);

        assert!(validate(p, "esp32-001", Utc::now()).is_err());
    }

    #[test]
    fn test_invalid_temperature() {
        let mut p = payload();
        p.temp = Some(150.0);

        assert!(validate(p, "esp32-001", Utc::now()).is_err());
    }

    #[test]
    fn test_empty_device_id() {
        let mut p = payload();
        p.device_id = Some("  ".to_string());

        assert!(validate(p, "esp32-001", Utc::now()).is_err());
    }

    #[test]
    fn test_parse_sensor_malformed_json() {
        let err = parse_sensor("dataSensor", b"invalid json", "esp32-001", Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn test_parse_sensor_wrong_type() {
        let body = br#"{"temp": "hot", "humi": 50, "light": 10, "rain_mm": 0}"#;
        assert!(parse_sensor("dataSensor", body, "esp32-001", Utc::now()).is_err());
    }

    #[test]
    fn test_parse_sensor_ok() {
        let body = br#"{"deviceId": "esp32-002", "temp": 24.97, "humi": 55.55, "light": 300, "rain_mm": 1.234}"#;
        let reading = parse_sensor("dataSensor", body, "esp32-001", Utc::now()).unwrap();

        assert_eq!(reading.device_id, "esp32-002");
        assert_eq!(reading.temperature, 25.0);
        assert_eq!(reading.humidity, 55.6);
        assert_eq!(reading.rainfall, 1.23);
    }
}
