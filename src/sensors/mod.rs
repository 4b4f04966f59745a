//! Sensor drivers and discovery
//!
//! The set of supported sensors is closed: each kind is a variant of
//! [`Sensor`], chosen from the address a device answers on. Adding a sensor
//! type means adding a variant here.

pub mod sht3x;

pub use sht3x::Sht3x;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use tracing::{debug, info};

use crate::error::BusFault;
use crate::mux::BusMultiplexer;
use crate::types::{BusAddress, RawReading};

/// Capabilities every supported sensor offers.
///
/// Drivers talk to whatever channel the caller has selected; they never
/// touch the multiplexer themselves.
pub trait SensorDriver {
    /// 7-bit device address on its sub-bus
    fn address(&self) -> u8;

    /// Soft-reset the device
    fn reset<B: I2c>(&self, bus: &mut B) -> Result<(), BusFault>;

    /// Clear the device status register
    fn clear<B: I2c>(&self, bus: &mut B) -> Result<(), BusFault>;

    /// Read the device status word
    fn status<B: I2c>(&self, bus: &mut B) -> Result<u16, BusFault>;

    /// Trigger a measurement, wait for the conversion and read the raw result
    fn raw_measure<B: I2c, D: DelayNs>(
        &self,
        bus: &mut B,
        delay: &mut D,
    ) -> Result<RawReading, BusFault>;
}

/// Supported sensor families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Sht3x,
}

impl SensorKind {
    /// Identify a sensor family from the address it responds on
    pub fn from_address(address: u8) -> Option<Self> {
        sht3x::ADDRESSES
            .contains(&address)
            .then_some(SensorKind::Sht3x)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Sht3x => "sht3x",
        }
    }

    pub fn driver(&self, address: u8) -> Sensor {
        match self {
            SensorKind::Sht3x => Sensor::Sht3x(Sht3x::new(address)),
        }
    }
}

/// A driver for one of the supported sensor families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Sht3x(Sht3x),
}

impl Sensor {
    pub fn kind(&self) -> SensorKind {
        match self {
            Sensor::Sht3x(_) => SensorKind::Sht3x,
        }
    }
}

impl SensorDriver for Sensor {
    fn address(&self) -> u8 {
        match self {
            Sensor::Sht3x(s) => s.address(),
        }
    }

    fn reset<B: I2c>(&self, bus: &mut B) -> Result<(), BusFault> {
        match self {
            Sensor::Sht3x(s) => s.reset(bus),
        }
    }

    fn clear<B: I2c>(&self, bus: &mut B) -> Result<(), BusFault> {
        match self {
            Sensor::Sht3x(s) => s.clear(bus),
        }
    }

    fn status<B: I2c>(&self, bus: &mut B) -> Result<u16, BusFault> {
        match self {
            Sensor::Sht3x(s) => s.status(bus),
        }
    }

    fn raw_measure<B: I2c, D: DelayNs>(
        &self,
        bus: &mut B,
        delay: &mut D,
    ) -> Result<RawReading, BusFault> {
        match self {
            Sensor::Sht3x(s) => s.raw_measure(bus, delay),
        }
    }
}

/// A sensor found during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredSensor {
    pub address: BusAddress,
    pub sensor: Sensor,
}

/// Result of a bus scan, threaded through later acquisition cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub sensors: Vec<DiscoveredSensor>,
}

impl Discovery {
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredSensor> {
        self.sensors.iter()
    }
}

/// Scan every channel and instantiate drivers for recognised addresses.
///
/// Unpopulated or failing channels simply contribute no sensors.
pub fn discover<I2C: I2c, D: DelayNs>(mux: &mut BusMultiplexer<I2C, D>) -> Discovery {
    let mut sensors = Vec::new();
    for scan in mux.scan() {
        for device in scan.devices {
            let Some(kind) = SensorKind::from_address(device) else {
                debug!(channel = scan.channel, device, "ignoring unknown device");
                continue;
            };
            let Ok(address) = BusAddress::new(scan.channel, device) else {
                continue;
            };
            info!(%address, kind = kind.as_str(), "found sensor");
            sensors.push(DiscoveredSensor {
                address,
                sensor: kind.driver(device),
            });
        }
    }
    Discovery { sensors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::mock::{MockBus, MockDevice, RecordingDelay};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kind_from_address() {
        assert_eq!(SensorKind::from_address(0x44), Some(SensorKind::Sht3x));
        assert_eq!(SensorKind::from_address(0x45), Some(SensorKind::Sht3x));
        assert_eq!(SensorKind::from_address(0x40), None);
    }

    #[test]
    fn test_discover_returns_known_sensors_in_bus_order() {
        let bus = MockBus::new()
            .with_device(5, 0x45, MockDevice::sht3x(0, 0))
            .with_device(4, 0x44, MockDevice::sht3x(0, 0))
            .with_device(4, 0x20, MockDevice::default());
        let mut mux = BusMultiplexer::new(bus, RecordingDelay::default());

        let discovery = discover(&mut mux);
        let ids: Vec<String> = discovery.iter().map(|s| s.address.to_string()).collect();
        assert_eq!(ids, vec!["0444", "0545"]);
        assert!(discovery
            .iter()
            .all(|s| s.sensor.kind() == SensorKind::Sht3x));
    }

    #[test]
    fn test_discover_on_empty_bus() {
        let mut mux = BusMultiplexer::new(MockBus::new(), RecordingDelay::default());
        assert!(discover(&mut mux).is_empty());
    }
}
