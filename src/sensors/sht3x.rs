//! Sensirion SHT3x-DIS humidity/temperature sensor
//!
//! Single-shot, high-repeatability measurements without clock stretching.
//! Each 16-bit word in a response is followed by a CRC-8 byte which is read
//! but not checked.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{Error as _, I2c};

use super::SensorDriver;
use crate::error::BusFault;
use crate::types::RawReading;

/// Addresses the SHT3x can be strapped to (ADDR pin low/high)
pub const ADDRESSES: [u8; 2] = [0x44, 0x45];

pub const MEASURE_COMMAND: [u8; 2] = [0x24, 0x00];
pub const STATUS_COMMAND: [u8; 2] = [0xF3, 0x2D];
pub const RESET_COMMAND: [u8; 2] = [0x30, 0xA2];
pub const CLEAR_COMMAND: [u8; 2] = [0x30, 0x41];

/// Wait between triggering a measurement and reading it back (datasheet max is 15 ms)
pub const MEASUREMENT_DELAY_MS: u32 = 20;

/// SHT3x driver bound to a device address.
///
/// The driver holds no bus; the caller passes in whatever handle currently
/// reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sht3x {
    address: u8,
}

impl Sht3x {
    pub fn new(address: u8) -> Self {
        Self { address }
    }

    /// Split a 6-byte measurement response `>HBHB` into (humidity, temperature)
    pub fn decode_measurement(response: &[u8; 6]) -> RawReading {
        let humidity = u16::from_be_bytes([response[0], response[1]]);
        let temperature = u16::from_be_bytes([response[3], response[4]]);
        RawReading::new(humidity, temperature)
    }

    fn command<B: I2c>(&self, bus: &mut B, command: &[u8]) -> Result<(), BusFault> {
        bus.write(self.address, command).map_err(|e| self.fault(e.kind()))
    }

    fn fetch<B: I2c>(&self, bus: &mut B, buf: &mut [u8]) -> Result<(), BusFault> {
        bus.read(self.address, buf).map_err(|e| self.fault(e.kind()))
    }

    fn fault(&self, kind: embedded_hal::i2c::ErrorKind) -> BusFault {
        BusFault::Device {
            address: self.address,
            kind,
        }
    }
}

impl SensorDriver for Sht3x {
    fn address(&self) -> u8 {
        self.address
    }

    fn reset<B: I2c>(&self, bus: &mut B) -> Result<(), BusFault> {
        self.command(bus, &RESET_COMMAND)
    }

    fn clear<B: I2c>(&self, bus: &mut B) -> Result<(), BusFault> {
        self.command(bus, &CLEAR_COMMAND)
    }

    fn status<B: I2c>(&self, bus: &mut B) -> Result<u16, BusFault> {
        self.command(bus, &STATUS_COMMAND)?;
        let mut response = [0u8; 3];
        self.fetch(bus, &mut response)?;
        Ok(u16::from_be_bytes([response[0], response[1]]))
    }

    fn raw_measure<B: I2c, D: DelayNs>(
        &self,
        bus: &mut B,
        delay: &mut D,
    ) -> Result<RawReading, BusFault> {
        self.command(bus, &MEASURE_COMMAND)?;
        delay.delay_ms(MEASUREMENT_DELAY_MS);
        let mut response = [0u8; 6];
        self.fetch(bus, &mut response)?;
        Ok(Self::decode_measurement(&response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::mock::{MockBus, MockDevice, RecordingDelay};
    use embedded_hal::i2c::ErrorKind;
    use pretty_assertions::assert_eq;

    fn bus_with_sensor(humidity: u16, temperature: u16) -> MockBus {
        let mut bus = MockBus::new().with_device(0, 0x44, MockDevice::sht3x(humidity, temperature));
        bus.mask = 0b1;
        bus
    }

    #[test]
    fn test_raw_measure_decodes_big_endian_fields() {
        let mut bus = bus_with_sensor(0x8000, 0x1234);
        let mut delay = RecordingDelay::default();

        let reading = Sht3x::new(0x44).raw_measure(&mut bus, &mut delay).unwrap();

        assert_eq!(reading, RawReading::new(0x8000, 0x1234));
        assert_eq!(bus.writes, vec![(0x44, MEASURE_COMMAND.to_vec())]);
        assert_eq!(delay.total_ns, 20_000_000);
    }

    #[test]
    fn test_checksum_bytes_are_ignored() {
        let reading = Sht3x::decode_measurement(&[0x01, 0x02, 0xFF, 0x03, 0x04, 0x00]);
        assert_eq!(reading, RawReading::new(0x0102, 0x0304));
    }

    #[test]
    fn test_status_reads_word() {
        let mut bus = bus_with_sensor(0, 0);
        assert_eq!(Sht3x::new(0x44).status(&mut bus).unwrap(), 0x8010);
    }

    #[test]
    fn test_reset_and_clear_send_commands() {
        let mut bus = bus_with_sensor(0, 0);
        let sensor = Sht3x::new(0x44);
        sensor.reset(&mut bus).unwrap();
        sensor.clear(&mut bus).unwrap();
        assert_eq!(
            bus.writes,
            vec![(0x44, RESET_COMMAND.to_vec()), (0x44, CLEAR_COMMAND.to_vec())]
        );
    }

    #[test]
    fn test_missing_device_is_bus_fault() {
        let mut bus = bus_with_sensor(0, 0);
        let mut delay = RecordingDelay::default();
        let err = Sht3x::new(0x45).raw_measure(&mut bus, &mut delay).unwrap_err();
        assert!(matches!(
            err,
            BusFault::Device {
                address: 0x45,
                kind: ErrorKind::NoAcknowledge(_)
            }
        ));
        assert_eq!(delay.total_ns, 0);
    }
}
