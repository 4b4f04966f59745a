//! I2C channel multiplexer (TCA9548A)
//!
//! The multiplexer sits at a fixed control address and gates up to eight
//! downstream buses. Exactly one channel is active at a time; selecting it is a
//! single bitmask write followed by a short settle delay. The write is skipped
//! when the requested channel is already active.
//!
//! All bus traffic goes through the one underlying [`I2c`] handle, so the
//! multiplexer must never be driven from two threads at once. Use
//! [`SharedMultiplexer`] when channels are visited from a worker pool.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{Error as _, ErrorType, I2c, Operation};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::BusFault;
use crate::types::CHANNEL_COUNT;

/// Default TCA9548A control address
pub const DEFAULT_MUX_ADDRESS: u8 = 0x70;

/// Settle delay after switching channels (milliseconds)
pub const DEFAULT_SETTLE_MS: u32 = 10;

/// Lowest and highest non-reserved 7-bit addresses probed by a scan
const SCAN_RANGE: std::ops::RangeInclusive<u8> = 0x08..=0x77;

/// Multiplexer tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// 7-bit control address of the multiplexer
    pub control_address: u8,
    /// Delay after a channel switch before the sub-bus is used
    pub settle_ms: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            control_address: DEFAULT_MUX_ADDRESS,
            settle_ms: DEFAULT_SETTLE_MS,
        }
    }
}

/// Devices that answered on one channel during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelScan {
    pub channel: u8,
    pub devices: Vec<u8>,
}

/// Owner of the shared bus and the "currently selected channel" state
pub struct BusMultiplexer<I2C, D> {
    i2c: I2C,
    delay: D,
    config: MuxConfig,
    /// Bitmask last written to the control register; 0 when unknown
    selected: u8,
}

impl<I2C: I2c, D: DelayNs> BusMultiplexer<I2C, D> {
    /// Create a multiplexer at the default control address
    pub fn new(i2c: I2C, delay: D) -> Self {
        Self::with_config(i2c, delay, MuxConfig::default())
    }

    pub fn with_config(i2c: I2C, delay: D, config: MuxConfig) -> Self {
        Self {
            i2c,
            delay,
            config,
            selected: 0,
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Channel selected by the last successful [`select`](Self::select)
    pub fn current_channel(&self) -> Option<u8> {
        (self.selected != 0).then(|| self.selected.trailing_zeros() as u8)
    }

    /// Route the bus to `channel`.
    ///
    /// No bus write happens when `channel` is already selected.
    pub fn select(&mut self, channel: u8) -> Result<(), BusFault> {
        check_channel(channel)?;
        self.switch_to(channel).map_err(|e| BusFault::Select {
            address: self.config.control_address,
            channel,
            kind: e.kind(),
        })
    }

    /// Borrow a handle that talks to devices on `channel`.
    ///
    /// The channel is selected immediately and re-selected (if needed) before
    /// every transaction made through the handle.
    pub fn channel(&mut self, channel: u8) -> Result<ChannelBus<'_, I2C, D>, BusFault> {
        self.select(channel)?;
        Ok(ChannelBus { mux: self, channel })
    }

    /// Visit every channel and list the device addresses that acknowledge.
    ///
    /// Channels whose selection fails are skipped. The multiplexer's own
    /// address is never reported.
    pub fn scan(&mut self) -> Vec<ChannelScan> {
        let control = self.config.control_address;
        let mut found = Vec::new();
        for channel in 0..CHANNEL_COUNT {
            if let Err(fault) = self.select(channel) {
                warn!(channel, %fault, "skipping channel during scan");
                continue;
            }
            let devices: Vec<u8> = SCAN_RANGE
                .filter(|&address| address != control)
                .filter(|&address| self.i2c.write(address, &[]).is_ok())
                .collect();
            debug!(channel, ?devices, "scanned channel");
            found.push(ChannelScan { channel, devices });
        }
        found
    }

    /// Read back the control register and decode the active channels
    pub fn selected_channels(&mut self) -> Result<Vec<u8>, BusFault> {
        let address = self.config.control_address;
        let mut buf = [0u8; 1];
        self.i2c
            .read(address, &mut buf)
            .map_err(|e| BusFault::Device {
                address,
                kind: e.kind(),
            })?;
        Ok((0..CHANNEL_COUNT)
            .filter(|bit| buf[0] & (1 << bit) != 0)
            .collect())
    }

    /// Give back the underlying bus and delay
    pub fn release(self) -> (I2C, D) {
        (self.i2c, self.delay)
    }

    fn switch_to(&mut self, channel: u8) -> Result<(), I2C::Error> {
        let mask = 1u8 << channel;
        if mask == self.selected {
            debug!(channel, "channel already selected, skipping write");
            return Ok(());
        }
        if let Err(e) = self.i2c.write(self.config.control_address, &[mask]) {
            self.selected = 0;
            return Err(e);
        }
        self.delay.delay_ms(self.config.settle_ms);
        self.selected = mask;
        Ok(())
    }

    /// Raw bus and delay for whichever channel is currently selected.
    ///
    /// Callers are responsible for having called [`select`](Self::select).
    pub fn selected_bus(&mut self) -> (&mut I2C, &mut D) {
        (&mut self.i2c, &mut self.delay)
    }
}

fn check_channel(channel: u8) -> Result<(), BusFault> {
    if channel >= CHANNEL_COUNT {
        return Err(BusFault::InvalidChannel(channel));
    }
    Ok(())
}

/// I2C handle bound to a single multiplexer channel
pub struct ChannelBus<'a, I2C, D> {
    mux: &'a mut BusMultiplexer<I2C, D>,
    channel: u8,
}

impl<I2C: I2c, D: DelayNs> ChannelBus<'_, I2C, D> {
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Raw bus and delay with this channel selected.
    ///
    /// Drivers take the pair directly so they stay usable on any bus handle.
    pub fn split(&mut self) -> Result<(&mut I2C, &mut D), BusFault> {
        self.mux.select(self.channel)?;
        Ok(self.mux.selected_bus())
    }
}

impl<I2C: I2c, D> ErrorType for ChannelBus<'_, I2C, D> {
    type Error = I2C::Error;
}

impl<I2C: I2c, D: DelayNs> I2c for ChannelBus<'_, I2C, D> {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        self.mux.switch_to(self.channel)?;
        self.mux.i2c.transaction(address, operations)
    }
}

/// Multiplexer shared between threads.
///
/// The lock is held for the whole select → settle → access sequence, so
/// interleaved selects from different threads cannot corrupt the addressed
/// channel.
pub struct SharedMultiplexer<I2C, D> {
    inner: Arc<Mutex<BusMultiplexer<I2C, D>>>,
}

impl<I2C, D> Clone for SharedMultiplexer<I2C, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I2C: I2c, D: DelayNs> SharedMultiplexer<I2C, D> {
    pub fn new(mux: BusMultiplexer<I2C, D>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(mux)),
        }
    }

    /// Run `f` against `channel` while holding exclusive bus access
    pub fn with_channel<R>(
        &self,
        channel: u8,
        f: impl FnOnce(&mut ChannelBus<'_, I2C, D>) -> R,
    ) -> Result<R, BusFault> {
        let mut mux = self.inner.lock();
        let mut bus = mux.channel(channel)?;
        Ok(f(&mut bus))
    }

    /// Exclusive access for multi-channel work such as a scan
    pub fn lock(&self) -> MutexGuard<'_, BusMultiplexer<I2C, D>> {
        self.inner.lock()
    }
}

/// Blocking delay backed by `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(std::time::Duration::from_nanos(u64::from(ns)));
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory TCA9548A with SHT3x-like devices behind it

    use super::*;
    use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
    use crate::sensors::sht3x::STATUS_COMMAND;
    use std::collections::{HashMap, HashSet};

    #[derive(Debug, Clone, Default)]
    pub struct MockDevice {
        pub measurement: Vec<u8>,
        pub status: Vec<u8>,
        last_command: Vec<u8>,
    }

    impl MockDevice {
        pub fn sht3x(humidity: u16, temperature: u16) -> Self {
            let [h0, h1] = humidity.to_be_bytes();
            let [t0, t1] = temperature.to_be_bytes();
            Self {
                measurement: vec![h0, h1, 0xAA, t0, t1, 0xBB],
                status: vec![0x80, 0x10, 0xCC],
                last_command: Vec::new(),
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct MockBus {
        pub control_address: u8,
        pub mask: u8,
        pub devices: HashMap<(u8, u8), MockDevice>,
        /// Every write in order as (address, bytes)
        pub writes: Vec<(u8, Vec<u8>)>,
        pub dead_channels: HashSet<u8>,
        pub dead_devices: HashSet<(u8, u8)>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self {
                control_address: DEFAULT_MUX_ADDRESS,
                ..Default::default()
            }
        }

        pub fn with_device(mut self, channel: u8, address: u8, device: MockDevice) -> Self {
            self.devices.insert((channel, address), device);
            self
        }

        pub fn mux_writes(&self) -> usize {
            self.writes
                .iter()
                .filter(|(address, _)| *address == self.control_address)
                .count()
        }

        fn active_channel(&self) -> Option<u8> {
            (self.mask.count_ones() == 1).then(|| self.mask.trailing_zeros() as u8)
        }

        fn nack() -> ErrorKind {
            ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)
        }
    }

    impl ErrorType for MockBus {
        type Error = ErrorKind;
    }

    impl I2c for MockBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            for op in operations.iter_mut() {
                match op {
                    Operation::Write(bytes) if address == self.control_address => {
                        let mask = bytes.first().copied().unwrap_or(0);
                        if self.dead_channels.contains(&(mask.trailing_zeros() as u8)) {
                            return Err(Self::nack());
                        }
                        self.writes.push((address, bytes.to_vec()));
                        self.mask = mask;
                    }
                    Operation::Read(buf) if address == self.control_address => {
                        if let Some(first) = buf.first_mut() {
                            *first = self.mask;
                        }
                    }
                    Operation::Write(bytes) => {
                        let key = (self.active_channel().ok_or_else(Self::nack)?, address);
                        if self.dead_devices.contains(&key) {
                            return Err(ErrorKind::Bus);
                        }
                        let device = self.devices.get_mut(&key).ok_or_else(Self::nack)?;
                        device.last_command = bytes.to_vec();
                        self.writes.push((address, bytes.to_vec()));
                    }
                    Operation::Read(buf) => {
                        let key = (self.active_channel().ok_or_else(Self::nack)?, address);
                        if self.dead_devices.contains(&key) {
                            return Err(ErrorKind::Bus);
                        }
                        let device = self.devices.get(&key).ok_or_else(Self::nack)?;
                        let source = if device.last_command == STATUS_COMMAND {
                            &device.status
                        } else {
                            &device.measurement
                        };
                        for (slot, byte) in buf.iter_mut().zip(source.iter()) {
                            *slot = *byte;
                        }
                    }
                }
            }
            Ok(())
        }
    }

    /// Delay that records instead of sleeping
    #[derive(Debug, Default)]
    pub struct RecordingDelay {
        pub total_ns: u64,
    }

    impl DelayNs for RecordingDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.total_ns += u64::from(ns);
        }
    }
}
