//! Core types for the beehive pipeline
//!
//! This module defines the values that flow between stages: sensor identity,
//! raw and physical readings, decoded payloads and outbound messages.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::FormatError;

/// Number of selectable sub-buses behind the multiplexer
pub const CHANNEL_COUNT: u8 = 8;

/// Full scale of a raw 16-bit sensor value
const RAW_FULL_SCALE: f64 = 65535.0;

/// Sensor identity: multiplexer channel plus 7-bit device address.
///
/// On the wire and in configuration files this is written as four lowercase
/// hex digits, channel first: channel 4 / address 0x44 is `"0444"`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct BusAddress {
    channel: u8,
    device: u8,
}

impl BusAddress {
    pub fn new(channel: u8, device: u8) -> Result<Self, FormatError> {
        if channel >= CHANNEL_COUNT || device > 0x7f {
            return Err(FormatError::InvalidAddress(format!(
                "channel {channel}, device 0x{device:02x}"
            )));
        }
        Ok(Self { channel, device })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn device(&self) -> u8 {
        self.device
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}", self.channel, self.device)
    }
}

impl FromStr for BusAddress {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FormatError::InvalidAddress(s.to_string()));
        }
        let channel =
            u8::from_str_radix(&s[..2], 16).map_err(|_| FormatError::InvalidAddress(s.into()))?;
        let device =
            u8::from_str_radix(&s[2..], 16).map_err(|_| FormatError::InvalidAddress(s.into()))?;
        Self::new(channel, device)
    }
}

impl TryFrom<String> for BusAddress {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BusAddress> for String {
    fn from(address: BusAddress) -> Self {
        address.to_string()
    }
}

/// Unconverted sensor output for one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReading {
    pub humidity_raw: u16,
    pub temperature_raw: u16,
}

impl RawReading {
    pub fn new(humidity_raw: u16, temperature_raw: u16) -> Self {
        Self {
            humidity_raw,
            temperature_raw,
        }
    }

    /// Convert to physical units using the SHT3x transfer functions
    pub fn to_physical(&self) -> PhysicalReading {
        PhysicalReading {
            temperature_c: raw_to_temperature(self.temperature_raw),
            humidity_pct: raw_to_humidity(self.humidity_raw),
        }
    }
}

/// Reading in physical units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalReading {
    pub temperature_c: f64,
    pub humidity_pct: f64,
}

impl PhysicalReading {
    pub fn new(temperature_c: f64, humidity_pct: f64) -> Self {
        Self {
            temperature_c,
            humidity_pct,
        }
    }

    /// Map back onto the raw scale, saturating at the 16-bit bounds
    pub fn to_raw(&self) -> RawReading {
        RawReading {
            humidity_raw: humidity_to_raw(self.humidity_pct),
            temperature_raw: temperature_to_raw(self.temperature_c),
        }
    }
}

/// Raw temperature to degrees Celsius, range [-45, 130]
pub fn raw_to_temperature(raw: u16) -> f64 {
    f64::from(raw) * 175.0 / RAW_FULL_SCALE - 45.0
}

/// Raw humidity to percent relative humidity, range [0, 100]
pub fn raw_to_humidity(raw: u16) -> f64 {
    f64::from(raw) * 100.0 / RAW_FULL_SCALE
}

/// Inverse of [`raw_to_temperature`], truncating and clamping to [0, 65535]
pub fn temperature_to_raw(temperature_c: f64) -> u16 {
    saturate((temperature_c + 45.0) / 175.0 * RAW_FULL_SCALE)
}

/// Inverse of [`raw_to_humidity`], truncating and clamping to [0, 65535]
pub fn humidity_to_raw(humidity_pct: f64) -> u16 {
    saturate(humidity_pct / 100.0 * RAW_FULL_SCALE)
}

fn saturate(value: f64) -> u16 {
    if value.is_nan() {
        return 0;
    }
    value.trunc().clamp(0.0, RAW_FULL_SCALE) as u16
}

/// Raw readings of one cycle keyed by sensor; keys are unique and iterate in bus order
pub type Readings = BTreeMap<BusAddress, RawReading>;

/// Calibrated readings of one cycle, in bus order
pub type CalibratedReadings = BTreeMap<BusAddress, PhysicalReading>;

/// One decoded acquisition cycle.
///
/// The timestamp is local wall-clock time; any UTC offset carried on the
/// wire is dropped during decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub sequence: u32,
    pub timestamp: NaiveDateTime,
    pub readings: Readings,
}

/// A message ready to hand to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub body: String,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
        }
    }
}
