use crate::devices::{Actuator, Switch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored sensor reading. Sensor fields are already quantized to their
/// display precision (see [`SensorField::quantize`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    pub id: i64,
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub light: i64,
    pub rainfall: f64,
    pub captured_at: DateTime<Utc>,
}

/// A reading accepted by the bridge but not yet assigned an identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub light: i64,
    pub rainfall: f64,
    pub captured_at: DateTime<Utc>,
}

impl NewReading {
    pub fn with_id(self, id: i64) -> TelemetryReading {
        TelemetryReading {
            id,
            device_id: self.device_id,
            temperature: self.temperature,
            humidity: self.humidity,
            light: self.light,
            rainfall: self.rainfall,
            captured_at: self.captured_at,
        }
    }
}

/// Raw `dataSensor` payload as published by the firmware.
///
/// Every sensor field is optional here so that a missing field surfaces as a
/// validation error naming the field rather than a generic parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorPayload {
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub temp: Option<f64>,
    #[serde(default)]
    pub humi: Option<f64>,
    #[serde(default)]
    pub light: Option<f64>,
    #[serde(default)]
    pub rain_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One row of the command history: the state an actuator was observed in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommandRecord {
    pub id: i64,
    pub device: String,
    pub status: Switch,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeviceCommandRecord {
    pub fn actuator(&self) -> Option<Actuator> {
        Actuator::from_display_name(&self.device)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorField {
    Temperature,
    Humidity,
    Light,
    Rainfall,
}

impl SensorField {
    pub const ALL: [SensorField; 4] = [
        SensorField::Temperature,
        SensorField::Humidity,
        SensorField::Light,
        SensorField::Rainfall,
    ];

    /// Accepts both the wire names (`temp`, `humi`, `rain_mm`) and the long names.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "temp" | "temperature" => Some(SensorField::Temperature),
            "humi" | "humidity" => Some(SensorField::Humidity),
            "light" => Some(SensorField::Light),
            "rain" | "rain_mm" | "rainfall" => Some(SensorField::Rainfall),
            _ => None,
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            SensorField::Temperature => "temp",
            SensorField::Humidity => "humi",
            SensorField::Light => "light",
            SensorField::Rainfall => "rain_mm",
        }
    }

    fn decimals(self) -> i32 {
        match self {
            SensorField::Temperature | SensorField::Humidity => 1,
            SensorField::Rainfall => 2,
            SensorField::Light => 0,
        }
    }

    /// Value in units of the display precision: `24.97` °C → `250`.
    ///
    /// Decimal fields round half away from zero; light truncates toward zero.
    /// The intermediate snap to 1e-6 absorbs binary noise such as
    /// `24.95 * 10 == 249.49999999999997`.
    pub fn scaled(self, value: f64) -> i64 {
        match self {
            SensorField::Light => value.trunc() as i64,
            _ => {
                let factor = 10f64.powi(self.decimals());
                let shifted = ((value * factor) * 1e6).round() / 1e6;
                shifted.round() as i64
            }
        }
    }

    pub fn quantize(self, value: f64) -> f64 {
        self.scaled(value) as f64 / 10f64.powi(self.decimals())
    }

    pub fn value_of(self, reading: &TelemetryReading) -> f64 {
        match self {
            SensorField::Temperature => reading.temperature,
            SensorField::Humidity => reading.humidity,
            SensorField::Light => reading.light as f64,
            SensorField::Rainfall => reading.rainfall,
        }
    }
}

/// Aggregate over one sensor field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldStats {
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStats {
    pub record_count: i64,
    pub temperature: FieldStats,
    pub humidity: FieldStats,
    pub light: FieldStats,
    pub rainfall: FieldStats,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub limit: u32,
}
