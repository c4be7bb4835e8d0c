//! Sensor readings reported by field nodes
//!
//! Two kinds of data arrive from the network: discrete readings carried in
//! application payloads (`t23.5|h40.1|l512`) and periodic analog IO samples
//! that are averaged between reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, XbeeError};
use crate::frame::NodeKey;

/// Reference voltage of the remote microcontroller ADC
const MCU_VREF: f64 = 3.286;
/// Full-scale count of the remote microcontroller ADC (12-bit)
const MCU_ADC_FULL_SCALE: f64 = 4095.0;
/// Peak-to-RMS divisor
const SQRT_2: f64 = 1.41421;

/// XBee ADC full-scale input in millivolts
const XBEE_ADC_MV: f64 = 1200.0;
/// Full-scale count of the XBee ADC (10-bit)
const XBEE_ADC_FULL_SCALE: f64 = 1023.0;
/// Board-specific correction of the temperature sensor divider
const TEMP_DIVIDER_CORRECTION: f64 = 1.057;
/// Current-clamp ratio, amperes per volt
const CLAMP_AMPS_PER_VOLT: f64 = 30.0;
/// Mains voltage used for the power estimate
const MAINS_VOLTS: f64 = 225.0;

/// Sensor kind, identified by the first character of a payload cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// `t`
    Temperature,
    /// `p`
    Pressure,
    /// `h`
    Humidity,
    /// `l`
    Light,
    /// `c`, analog
    Current,
    /// `s`, analog
    Sound,
    /// `g`, analog
    Gas,
}

impl SensorKind {
    /// Look up the sensor for a payload tag
    pub fn from_tag(tag: char) -> Option<Self> {
        Some(match tag {
            't' => Self::Temperature,
            'p' => Self::Pressure,
            'h' => Self::Humidity,
            'l' => Self::Light,
            'c' => Self::Current,
            's' => Self::Sound,
            'g' => Self::Gas,
            _ => return None,
        })
    }

    /// Payload tag of this sensor
    pub fn tag(&self) -> char {
        match self {
            Self::Temperature => 't',
            Self::Pressure => 'p',
            Self::Humidity => 'h',
            Self::Light => 'l',
            Self::Current => 'c',
            Self::Sound => 's',
            Self::Gas => 'g',
        }
    }

    /// Whether the value is a raw ADC count that needs scaling
    pub fn is_analog(&self) -> bool {
        matches!(self, Self::Current | Self::Sound | Self::Gas)
    }

    /// Convert a transmitted value into the stored reading
    pub fn scale(&self, value: f64) -> f64 {
        if self.is_analog() {
            scale_analog(value)
        } else {
            value
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Scale a raw 12-bit ADC count to RMS millivolts, one decimal place
pub fn scale_analog(raw: f64) -> f64 {
    round1(raw * MCU_VREF * 1000.0 / MCU_ADC_FULL_SCALE / SQRT_2)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Temperature sensor reading derived from an AD3 sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSample {
    /// Sensor output in volts
    pub volts: f64,
    /// Degrees Celsius (0.5 V = 0 °C, 10 mV/°C)
    pub celsius: f64,
}

/// Convert a raw AD3 sample into a temperature
pub fn temperature_from_ad3(raw: u16) -> TemperatureSample {
    let volts = (raw as f64 / XBEE_ADC_MV) * TEMP_DIVIDER_CORRECTION;
    TemperatureSample {
        volts,
        celsius: 100.0 * (volts - 0.5),
    }
}

/// Current-clamp reading derived from an AD0 sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    /// RMS millivolts at the clamp
    pub millivolts: f64,
    /// Amperes
    pub amps: f64,
    /// Watts at mains voltage
    pub watts: f64,
}

/// Convert a raw AD0 sample into a power estimate
pub fn power_from_ad0(raw: u16) -> PowerSample {
    let millivolts = (raw as f64 * XBEE_ADC_MV) / XBEE_ADC_FULL_SCALE / SQRT_2;
    let amps = millivolts * CLAMP_AMPS_PER_VOLT / 1000.0;
    PowerSample {
        millivolts,
        amps,
        watts: MAINS_VOLTS * amps,
    }
}

/// Parse a sensor payload into readings
///
/// Cells are separated by `|`; the first character selects the sensor and
/// the rest is the value. Unknown tags and unparsable values are skipped.
pub fn parse_sensor_payload(payload: &[u8]) -> Vec<(SensorKind, f64)> {
    let text = String::from_utf8_lossy(payload);
    text.split('|')
        .filter_map(|cell| {
            let mut chars = cell.chars();
            let kind = SensorKind::from_tag(chars.next()?)?;
            let value: f64 = chars.as_str().trim().parse().ok()?;
            Some((kind, kind.scale(value)))
        })
        .collect()
}

/// A reading with the time it was stored
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Value after scaling
    pub value: f64,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

/// Per-node telemetry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Last reading per sensor
    pub readings: BTreeMap<SensorKind, Reading>,
    /// Running sum of averaged samples
    pub sum: f64,
    /// Number of averaged samples
    pub count: u64,
}

/// Owner of all telemetry records
#[derive(Debug, Clone, Default)]
pub struct TelemetryStore {
    records: BTreeMap<NodeKey, TelemetryRecord>,
}

impl TelemetryStore {
    /// Create an empty record for each field node
    pub fn new(keys: impl IntoIterator<Item = NodeKey>) -> Self {
        Self {
            records: keys
                .into_iter()
                .map(|k| (k, TelemetryRecord::default()))
                .collect(),
        }
    }

    fn record_mut(&mut self, key: &NodeKey) -> Result<&mut TelemetryRecord> {
        self.records
            .get_mut(key)
            .ok_or_else(|| XbeeError::InvalidKey(key.clone()))
    }

    /// Overwrite the last value of a sensor
    pub fn record_reading(&mut self, key: &NodeKey, kind: SensorKind, value: f64) -> Result<()> {
        let record = self.record_mut(key)?;
        record.readings.insert(
            kind,
            Reading {
                value,
                at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Add a sample to the running average
    pub fn accumulate(&mut self, key: &NodeKey, value: f64) -> Result<()> {
        let record = self.record_mut(key)?;
        record.sum += value;
        record.count += 1;
        Ok(())
    }

    /// Take the mean of accumulated samples and reset the accumulator
    ///
    /// Returns `None` when nothing was accumulated since the last drain.
    pub fn drain_average(&mut self, key: &NodeKey) -> Result<Option<f64>> {
        let record = self.record_mut(key)?;
        let mean = if record.count == 0 {
            None
        } else {
            Some(record.sum / record.count as f64)
        };
        record.sum = 0.0;
        record.count = 0;
        Ok(mean)
    }

    /// Last value of a sensor
    pub fn last_reading(&self, key: &NodeKey, kind: SensorKind) -> Result<Option<Reading>> {
        self.records
            .get(key)
            .map(|r| r.readings.get(&kind).copied())
            .ok_or_else(|| XbeeError::InvalidKey(key.clone()))
    }

    /// Full record of a node
    pub fn record(&self, key: &NodeKey) -> Result<&TelemetryRecord> {
        self.records
            .get(key)
            .ok_or_else(|| XbeeError::InvalidKey(key.clone()))
    }

    /// Copy of every record
    pub fn snapshot(&self) -> BTreeMap<NodeKey, TelemetryRecord> {
        self.records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> NodeKey {
        NodeKey::new(k)
    }

    fn value(store: &TelemetryStore, k: &str, kind: SensorKind) -> Option<f64> {
        store.last_reading(&key(k), kind).unwrap().map(|r| r.value)
    }

    #[test]
    fn test_parse_sensor_payload() {
        let readings = parse_sensor_payload(b"t23.5|h40.1|l512");
        assert_eq!(
            readings,
            vec![
                (SensorKind::Temperature, 23.5),
                (SensorKind::Humidity, 40.1),
                (SensorKind::Light, 512.0),
            ]
        );
    }

    #[test]
    fn test_unknown_tags_are_skipped() {
        let readings = parse_sensor_payload(b"x99|t21.0||h");
        assert_eq!(readings, vec![(SensorKind::Temperature, 21.0)]);
    }

    #[test]
    fn test_analog_scaling() {
        let expected = ((100.0 * 3.286 * 1000.0 / 4095.0 / 1.41421) * 10.0f64).round() / 10.0;
        assert_eq!(scale_analog(100.0), expected);
        assert_eq!(scale_analog(100.0), 56.7);
        assert_eq!(SensorKind::Gas.scale(40.0), 22.7);
        assert_eq!(SensorKind::Temperature.scale(40.0), 40.0);
    }

    #[test]
    fn test_temperature_conversion() {
        let sample = temperature_from_ad3(600);
        assert!((sample.volts - 0.5285).abs() < 1e-9);
        assert!((sample.celsius - 2.85).abs() < 1e-9);
    }

    #[test]
    fn test_power_conversion() {
        let sample = power_from_ad0(1023);
        assert!((sample.millivolts - 1200.0 / 1.41421).abs() < 1e-9);
        assert!((sample.watts - 225.0 * sample.amps).abs() < 1e-9);
    }

    #[test]
    fn test_readings_overwrite_only_their_tag() {
        let mut store = TelemetryStore::new([key("xb1")]);
        store
            .record_reading(&key("xb1"), SensorKind::Pressure, 1013.0)
            .unwrap();
        for (kind, v) in parse_sensor_payload(b"t23.5|h40.1|l512|q7") {
            store.record_reading(&key("xb1"), kind, v).unwrap();
        }

        assert_eq!(value(&store, "xb1", SensorKind::Temperature), Some(23.5));
        assert_eq!(value(&store, "xb1", SensorKind::Pressure), Some(1013.0));
        assert_eq!(value(&store, "xb1", SensorKind::Gas), None);
    }

    #[test]
    fn test_drain_average_resets() {
        let mut store = TelemetryStore::new([key("xb1")]);
        store.accumulate(&key("xb1"), 20.0).unwrap();
        store.accumulate(&key("xb1"), 22.0).unwrap();

        assert_eq!(store.drain_average(&key("xb1")).unwrap(), Some(21.0));
        assert_eq!(store.drain_average(&key("xb1")).unwrap(), None);
        assert_eq!(store.record(&key("xb1")).unwrap().count, 0);
    }

    #[test]
    fn test_unknown_node_is_rejected() {
        let mut store = TelemetryStore::new([key("xb1")]);
        assert!(store.accumulate(&key("xb0"), 1.0).is_err());
        assert!(store.last_reading(&key("xb9"), SensorKind::Light).is_err());
    }
}
