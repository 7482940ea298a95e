use rand::Rng;
use serde::{Deserialize, Serialize};

/// Body of a `dataSensor` message, as the board firmware sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub temp: f64,
    pub humi: f64,
    pub light: f64,
    pub rain_mm: f64,
}

/// Slowly drifting readings, with the occasional out-of-range sample so the
/// relay's validation gets exercised.
#[derive(Debug, Clone)]
pub struct Weather {
    temp: f64,
    humi: f64,
    light: f64,
    raining: bool,
    outlier_rate: f64,
}

impl Weather {
    pub fn new(outlier_rate: f64) -> Self {
        Self {
            temp: 27.0,
            humi: 65.0,
            light: 800.0,
            raining: false,
            outlier_rate: outlier_rate.clamp(0.0, 1.0),
        }
    }

    pub fn next(&mut self, rng: &mut impl Rng, device_id: &str) -> SensorReading {
        self.temp = (self.temp + rng.gen_range(-0.3..0.3)).clamp(15.0, 38.0);
        self.humi = (self.humi + rng.gen_range(-1.0..1.0)).clamp(30.0, 95.0);
        self.light = (self.light + rng.gen_range(-50.0..50.0)).clamp(0.0, 5000.0);
        if rng.gen_bool(0.02) {
            self.raining = !self.raining;
        }

        let rain_mm = if self.raining {
            rng.gen_range(0.1..8.0)
        } else {
            0.0
        };

        let temp = if rng.gen_bool(self.outlier_rate) {
            rng.gen_range(150.0..200.0)
        } else {
            self.temp
        };

        SensorReading {
            device_id: device_id.to_string(),
            temp,
            humi: self.humi,
            light: self.light,
            rain_mm,
        }
    }
}
