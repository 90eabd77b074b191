//! Sensor readings captured on the edge device.
//!
//! A reading is the common capture envelope (device, sequence, capture time)
//! plus a sensor-specific payload. New sensor types are added as a new
//! [`Payload`] variant and a matching [`SensorKind`].

use serde::{Deserialize, Serialize};

use crate::protocol;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    #[default]
    Lux,
}

impl SensorKind {
    /// Name of the sensor table, which doubles as the queue name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Lux => "lux",
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    /// Illuminance in lux.
    Lux(f64),
}

impl Payload {
    pub fn kind(&self) -> SensorKind {
        match self {
            Payload::Lux(_) => SensorKind::Lux,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Payload::Lux(value) => *value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    /// Per-device counter, informational only.
    pub sequence: i64,
    /// Capture time, seconds since the epoch.
    pub timestamp: i64,
    pub payload: Payload,
}

impl Reading {
    pub fn lux(device_id: impl Into<String>, sequence: i64, value: f64, timestamp: i64) -> Self {
        Self {
            device_id: device_id.into(),
            sequence,
            timestamp,
            payload: Payload::Lux(value),
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.payload.kind()
    }

    /// Uplink line for this reading, without the trailing newline.
    pub fn encode(&self) -> String {
        protocol::encode(self)
    }
}
