//! Core telemetry data types shared by the link, processor and gesture modules

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TelemetryError;

/// Standard gravity (m/s² per g)
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// Acceleration axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Index into `[x, y, z]` arrays
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        })
    }
}

impl FromStr for Axis {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Axis::X),
            "Y" => Ok(Axis::Y),
            "Z" => Ok(Axis::Z),
            other => Err(TelemetryError::InvalidConfig(format!("unknown axis '{}'", other))),
        }
    }
}

/// Accelerometer full-scale range on the remote node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScaleSetting {
    #[default]
    TwoG,
    SixG,
}

impl ScaleSetting {
    /// Full-scale range in g
    pub fn range_g(self) -> f64 {
        match self {
            ScaleSetting::TwoG => 2.0,
            ScaleSetting::SixG => 6.0,
        }
    }

    /// Byte used on the wire (the range in g)
    pub fn to_wire(self) -> u8 {
        match self {
            ScaleSetting::TwoG => 2,
            ScaleSetting::SixG => 6,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            2 => Some(ScaleSetting::TwoG),
            6 => Some(ScaleSetting::SixG),
            _ => None,
        }
    }
}

impl fmt::Display for ScaleSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScaleSetting::TwoG => "2G",
            ScaleSetting::SixG => "6G",
        })
    }
}

impl FromStr for ScaleSetting {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "2" | "2G" => Ok(ScaleSetting::TwoG),
            "6" | "6G" => Ok(ScaleSetting::SixG),
            other => Err(TelemetryError::InvalidConfig(format!("unknown scale '{}'", other))),
        }
    }
}

/// One persisted record: `(timestamp, ax, ay, az)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub timestamp: f64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
}

/// A single tri-axis acceleration sample
///
/// Immutable once created; the magnitude is derived at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "SeriesRecord", into = "SeriesRecord")]
pub struct TelemetrySample {
    timestamp: f64,
    accel: [f64; 3],
    magnitude: f64,
}

impl TelemetrySample {
    /// Create a sample from a timestamp (seconds) and acceleration in g
    pub fn new(timestamp: f64, ax: f64, ay: f64, az: f64) -> Self {
        Self {
            timestamp,
            accel: [ax, ay, az],
            magnitude: (ax * ax + ay * ay + az * az).sqrt(),
        }
    }

    /// Timestamp in seconds
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn ax(&self) -> f64 {
        self.accel[0]
    }

    pub fn ay(&self) -> f64 {
        self.accel[1]
    }

    pub fn az(&self) -> f64 {
        self.accel[2]
    }

    /// Acceleration along one axis in g
    pub fn axis(&self, axis: Axis) -> f64 {
        self.accel[axis.index()]
    }

    /// Acceleration as `[x, y, z]` in g
    pub fn accel(&self) -> [f64; 3] {
        self.accel
    }

    /// |a| in g
    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }
}

impl From<SeriesRecord> for TelemetrySample {
    fn from(r: SeriesRecord) -> Self {
        TelemetrySample::new(r.timestamp, r.ax, r.ay, r.az)
    }
}

impl From<TelemetrySample> for SeriesRecord {
    fn from(s: TelemetrySample) -> Self {
        SeriesRecord {
            timestamp: s.timestamp,
            ax: s.accel[0],
            ay: s.accel[1],
            az: s.accel[2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnitude_derived() {
        let s = TelemetrySample::new(0.5, 3.0, 4.0, 0.0);
        assert_eq!(s.magnitude(), 5.0);
        assert_eq!(s.axis(Axis::Y), 4.0);
        assert_eq!(s.timestamp(), 0.5);
    }

    #[test]
    fn test_scale_wire_values() {
        assert_eq!(ScaleSetting::from_wire(6), Some(ScaleSetting::SixG));
        assert_eq!(ScaleSetting::from_wire(4), None);
        assert_eq!(ScaleSetting::SixG.to_wire(), 6);
        assert_eq!("2g".parse::<ScaleSetting>().unwrap(), ScaleSetting::TwoG);
    }

    #[test]
    fn test_sample_serializes_as_record() {
        let s = TelemetrySample::new(1.25, 0.1, -0.2, 1.0);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"timestamp\":1.25"));
        let back: TelemetrySample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
