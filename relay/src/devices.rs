//! Static actuator table and MQTT topic layout.
//!
//! The firmware addresses actuators by slug (`led1`..`led3`) while the
//! command history stores the display name. The mapping is fixed and
//! bidirectional; no other synonyms are accepted.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const SENSOR_TOPIC: &str = "dataSensor";
pub const STATE_FILTER: &str = "device/+/state";
pub const GET_STATE_FILTER: &str = "devices/+/get_state";
pub const RAIN_THRESHOLD_TOPIC: &str = "config/rain_threshold";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Actuator {
    Light,
    Fan,
    AirConditioner,
}

impl Actuator {
    pub const ALL: [Actuator; 3] = [Actuator::Light, Actuator::Fan, Actuator::AirConditioner];

    pub fn slug(self) -> &'static str {
        match self {
            Actuator::Light => "led1",
            Actuator::Fan => "led2",
            Actuator::AirConditioner => "led3",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Actuator::Light => "Đèn",
            Actuator::Fan => "Quạt",
            Actuator::AirConditioner => "Điều hòa",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.slug() == slug)
    }

    pub fn from_display_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.display_name() == name)
    }

    /// Resolves a caller-supplied name: slug or display name, case-insensitive.
    pub fn resolve(name: &str) -> Option<Self> {
        let wanted = name.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        Self::ALL.into_iter().find(|a| {
            a.slug() == wanted || a.display_name().to_lowercase() == wanted
        })
    }

    pub fn command_topic(self) -> String {
        format!("control/{}", self.slug())
    }

    pub fn state_topic(self) -> String {
        format!("device/{}/state", self.slug())
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Observed or requested actuator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Switch {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl Switch {
    pub fn as_str(self) -> &'static str {
        match self {
            Switch::On => "ON",
            Switch::Off => "OFF",
        }
    }

    /// Normalizes a raw payload (`" on\n"` → `On`). Anything else is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ON" => Some(Switch::On),
            "OFF" => Some(Switch::Off),
            _ => None,
        }
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an inbound publish should be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    Sensor,
    DeviceState { slug: &'a str },
    StateRequest { device_id: &'a str },
    Unknown,
}

impl<'a> Route<'a> {
    pub fn classify(topic: &'a str) -> Self {
        if topic == SENSOR_TOPIC {
            return Route::Sensor;
        }

        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            ["device", slug, "state"] if !slug.is_empty() => Route::DeviceState { slug: *slug },
            ["devices", id, "get_state"] => Route::StateRequest { device_id: *id },
            _ => Route::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_display_roundtrip() {
        for actuator in Actuator::ALL {
            assert_eq!(Actuator::from_slug(actuator.slug()), Some(actuator));
            assert_eq!(
                Actuator::from_display_name(actuator.display_name()),
                Some(actuator)
            );
        }
    }

    #[test]
    fn test_resolve_accepts_slug_and_name() {
        assert_eq!(Actuator::resolve("led2"), Some(Actuator::Fan));
        assert_eq!(Actuator::resolve(" LED3 "), Some(Actuator::AirConditioner));
        assert_eq!(Actuator::resolve("quạt"), Some(Actuator::Fan));
        assert_eq!(Actuator::resolve("ĐIỀU HÒA"), Some(Actuator::AirConditioner));
        assert_eq!(Actuator::resolve("lamp"), None);
        assert_eq!(Actuator::resolve(""), None);
    }

    #[test]
    fn test_topics() {
        assert_eq!(Actuator::Light.command_topic(), "control/led1");
        assert_eq!(Actuator::Fan.state_topic(), "device/led2/state");
    }

    #[test]
    fn test_switch_parse() {
        assert_eq!(Switch::parse("ON"), Some(Switch::On));
        assert_eq!(Switch::parse(" off\n"), Some(Switch::Off));
        assert_eq!(Switch::parse("On"), Some(Switch::On));
        assert_eq!(Switch::parse("1"), None);
        assert_eq!(Switch::parse(""), None);
    }

    #[test]
    fn test_switch_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Switch::Off).unwrap(), "\"OFF\"");
    }

    #[test]
    fn test_route_classify() {
        assert_eq!(Route::classify("dataSensor"), Route::Sensor);
        assert_eq!(
            Route::classify("device/led1/state"),
            Route::DeviceState { slug: "led1" }
        );
        assert_eq!(
            Route::classify("devices/esp32-001/get_state"),
            Route::StateRequest {
                device_id: "esp32-001"
            }
        );
        assert_eq!(Route::classify("device//state"), Route::Unknown);
        assert_eq!(Route::classify("control/led1"), Route::Unknown);
        assert_eq!(Route::classify("device/led1/state/extra"), Route::Unknown);
    }
}
